//! Shape symbols and the integer algebra over them
//!
//! Dimensions of kernel arrays are [`SymExpr`]s: integer polynomials over
//! shape symbols (`M`, `N`) and integer scalar variables (loop induction
//! variables), with floor-division and modulo kept as opaque atoms when they
//! cannot be folded. Every constructor returns the canonical form, so
//! structural equality is the shape-equality relation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ArrayType, DType};

/// A named placeholder for an array dimension, with its assumptions
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShapeSymbol {
    pub name: String,
    pub positive: bool,
}

impl ShapeSymbol {
    /// Dimension symbols are positive unless stated otherwise
    pub fn positive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            positive: true,
        }
    }

    pub fn expr(&self) -> SymExpr {
        SymExpr::symbol(&self.name)
    }
}

impl fmt::Display for ShapeSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Indivisible factor of a term
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Atom {
    Symbol(String),
    Var { name: String, dtype: DType },
    FloorDiv(Box<SymExpr>, Box<SymExpr>),
    Mod(Box<SymExpr>, Box<SymExpr>),
}

/// `coeff * factors[0] * factors[1] * ...`; no factors is a constant
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term {
    pub coeff: i64,
    pub factors: Vec<Atom>,
}

/// Canonical integer expression: sorted terms, unique monomials, no zero coefficients
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SymExpr {
    terms: Vec<Term>,
}

fn floor_div_i64(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if a.checked_rem(b)? != 0 && ((a < 0) != (b < 0)) {
        q.checked_sub(1)
    } else {
        Some(q)
    }
}

fn floor_mod_i64(a: i64, b: i64) -> Option<i64> {
    if b == -1 {
        return Some(0);
    }
    a.checked_sub(b.checked_mul(floor_div_i64(a, b)?)?)
}

impl SymExpr {
    /// Collect like terms; `None` when a coefficient overflows
    fn from_terms(terms: impl IntoIterator<Item = Term>) -> Option<Self> {
        let mut collected: BTreeMap<Vec<Atom>, i64> = BTreeMap::new();
        for term in terms {
            let mut factors = term.factors;
            factors.sort();
            let coeff = collected.entry(factors).or_insert(0);
            *coeff = coeff.checked_add(term.coeff)?;
        }
        Some(Self {
            terms: collected
                .into_iter()
                .filter(|(_, coeff)| *coeff != 0)
                .map(|(factors, coeff)| Term { coeff, factors })
                .collect(),
        })
    }

    fn atom(atom: Atom) -> Self {
        Self {
            terms: vec![Term {
                coeff: 1,
                factors: vec![atom],
            }],
        }
    }

    pub fn int(value: i64) -> Self {
        if value == 0 {
            return Self::zero();
        }
        Self {
            terms: vec![Term {
                coeff: value,
                factors: Vec::new(),
            }],
        }
    }

    pub fn zero() -> Self {
        Self { terms: Vec::new() }
    }

    pub fn symbol(name: impl Into<String>) -> Self {
        Self::atom(Atom::Symbol(name.into()))
    }

    pub fn var(name: impl Into<String>, dtype: DType) -> Self {
        Self::atom(Atom::Var {
            name: name.into(),
            dtype,
        })
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    // Arithmetic is checked: `None` means a coefficient left the i64 range.

    pub fn add(&self, other: &SymExpr) -> Option<SymExpr> {
        Self::from_terms(self.terms.iter().chain(other.terms.iter()).cloned())
    }

    pub fn neg(&self) -> Option<SymExpr> {
        let terms = self
            .terms
            .iter()
            .map(|t| {
                t.coeff.checked_neg().map(|coeff| Term {
                    coeff,
                    factors: t.factors.clone(),
                })
            })
            .collect::<Option<Vec<_>>>()?;
        Self::from_terms(terms)
    }

    pub fn sub(&self, other: &SymExpr) -> Option<SymExpr> {
        self.add(&other.neg()?)
    }

    pub fn mul(&self, other: &SymExpr) -> Option<SymExpr> {
        let mut product = Vec::with_capacity(self.terms.len() * other.terms.len());
        for a in &self.terms {
            for b in &other.terms {
                product.push(Term {
                    coeff: a.coeff.checked_mul(b.coeff)?,
                    factors: a.factors.iter().chain(b.factors.iter()).cloned().collect(),
                });
            }
        }
        Self::from_terms(product)
    }

    /// Divide every coefficient by `divisor` if all of them are multiples of it
    fn exact_div(&self, divisor: i64) -> Option<SymExpr> {
        if divisor == 0 || self.terms.iter().any(|t| t.coeff.checked_rem(divisor) != Some(0)) {
            return None;
        }
        let terms = self
            .terms
            .iter()
            .map(|t| {
                t.coeff.checked_div(divisor).map(|coeff| Term {
                    coeff,
                    factors: t.factors.clone(),
                })
            })
            .collect::<Option<Vec<_>>>()?;
        Self::from_terms(terms)
    }

    /// Floor division; `None` for a literal zero divisor or on overflow
    pub fn floor_div(&self, divisor: &SymExpr) -> Option<SymExpr> {
        match (self.as_const(), divisor.as_const()) {
            (_, Some(0)) => None,
            (Some(a), Some(b)) => floor_div_i64(a, b).map(Self::int),
            (_, Some(b)) => Some(
                self.exact_div(b)
                    .unwrap_or_else(|| Self::atom(Atom::FloorDiv(Box::new(self.clone()), Box::new(divisor.clone())))),
            ),
            _ => Some(Self::atom(Atom::FloorDiv(
                Box::new(self.clone()),
                Box::new(divisor.clone()),
            ))),
        }
    }

    /// Floor modulo (result has the divisor's sign); `None` for a zero divisor or on overflow
    pub fn floor_mod(&self, divisor: &SymExpr) -> Option<SymExpr> {
        match (self.as_const(), divisor.as_const()) {
            (_, Some(0)) => None,
            (Some(a), Some(b)) => floor_mod_i64(a, b).map(Self::int),
            (_, Some(b)) if self.exact_div(b).is_some() => Some(Self::zero()),
            _ => Some(Self::atom(Atom::Mod(
                Box::new(self.clone()),
                Box::new(divisor.clone()),
            ))),
        }
    }

    pub fn as_const(&self) -> Option<i64> {
        match self.terms.as_slice() {
            [] => Some(0),
            [Term { coeff, factors }] if factors.is_empty() => Some(*coeff),
            _ => None,
        }
    }

    /// The plain symbol name if this expression is exactly one symbol
    pub fn as_symbol(&self) -> Option<&str> {
        match self.terms.as_slice() {
            [Term { coeff: 1, factors }] => match factors.as_slice() {
                [Atom::Symbol(name)] => Some(name),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        self.as_const().is_some()
    }

    /// Shape symbols this expression depends on
    pub fn free_symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols(&self, out: &mut BTreeSet<String>) {
        for term in &self.terms {
            for atom in &term.factors {
                match atom {
                    Atom::Symbol(name) => {
                        out.insert(name.clone());
                    }
                    Atom::Var { .. } => {}
                    Atom::FloorDiv(a, b) | Atom::Mod(a, b) => {
                        a.collect_symbols(out);
                        b.collect_symbols(out);
                    }
                }
            }
        }
    }

    /// Provably `>= 0` under the assumptions
    pub fn is_nonneg(&self, assumptions: &Assumptions) -> bool {
        self.terms
            .iter()
            .all(|t| t.coeff > 0 && t.factors.iter().all(|a| assumptions.atom_nonneg(a)))
    }

    // The proofs below answer `false` whenever the arithmetic overflows.

    /// Provably `> 0` (integers: `x - 1 >= 0`)
    pub fn is_positive(&self, assumptions: &Assumptions) -> bool {
        self.sub(&Self::int(1)).is_some_and(|e| e.is_nonneg(assumptions))
    }

    /// Provably `self < other`
    pub fn provably_lt(&self, other: &SymExpr, assumptions: &Assumptions) -> bool {
        other.sub(self).is_some_and(|e| e.is_positive(assumptions))
    }

    /// Provably `self >= other`
    pub fn provably_ge(&self, other: &SymExpr, assumptions: &Assumptions) -> bool {
        self.sub(other).is_some_and(|e| e.is_nonneg(assumptions))
    }

    /// Provably negative
    pub fn is_negative(&self, assumptions: &Assumptions) -> bool {
        self.neg().is_some_and(|e| e.is_positive(assumptions))
    }
}

impl From<i64> for SymExpr {
    fn from(value: i64) -> Self {
        SymExpr::int(value)
    }
}

fn fmt_operand(f: &mut fmt::Formatter<'_>, expr: &SymExpr) -> fmt::Result {
    let simple = match expr.terms.as_slice() {
        [] => true,
        [Term { coeff, factors }] => factors.is_empty() || (*coeff == 1 && factors.len() == 1),
        _ => false,
    };
    if simple {
        write!(f, "{}", expr)
    } else {
        write!(f, "({})", expr)
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Symbol(name) => write!(f, "{}", name),
            Atom::Var { name, .. } => write!(f, "{}", name),
            Atom::FloorDiv(a, b) => {
                fmt_operand(f, a)?;
                write!(f, " // ")?;
                fmt_operand(f, b)
            }
            Atom::Mod(a, b) => {
                fmt_operand(f, a)?;
                write!(f, " % ")?;
                fmt_operand(f, b)
            }
        }
    }
}

fn fmt_monomial(f: &mut fmt::Formatter<'_>, coeff: u64, factors: &[Atom]) -> fmt::Result {
    if factors.is_empty() {
        return write!(f, "{}", coeff);
    }
    if coeff != 1 {
        write!(f, "{}*", coeff)?;
    }
    let wrap = coeff != 1 || factors.len() > 1;
    for (i, atom) in factors.iter().enumerate() {
        if i > 0 {
            write!(f, "*")?;
        }
        match atom {
            Atom::FloorDiv(..) | Atom::Mod(..) if wrap => write!(f, "({})", atom)?,
            _ => write!(f, "{}", atom)?,
        }
    }
    Ok(())
}

impl fmt::Display for SymExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "0");
        }

        // Constant last: `M + 1` rather than `1 + M`
        let ordered = self
            .terms
            .iter()
            .filter(|t| !t.factors.is_empty())
            .chain(self.terms.iter().filter(|t| t.factors.is_empty()));

        for (i, term) in ordered.enumerate() {
            match (i, term.coeff < 0) {
                (0, false) => {}
                (0, true) => write!(f, "-")?,
                (_, false) => write!(f, " + ")?,
                (_, true) => write!(f, " - ")?,
            }
            fmt_monomial(f, term.coeff.unsigned_abs(), &term.factors)?;
        }
        Ok(())
    }
}

/// Facts used to decide signs of symbolic expressions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assumptions {
    pub positive_symbols: BTreeSet<String>,
    pub nonneg_vars: BTreeSet<String>,
}

impl Assumptions {
    fn atom_nonneg(&self, atom: &Atom) -> bool {
        match atom {
            Atom::Symbol(name) => self.positive_symbols.contains(name),
            Atom::Var { name, dtype } => dtype.is_unsigned() || self.nonneg_vars.contains(name),
            Atom::FloorDiv(a, b) => a.is_nonneg(self) && b.is_positive(self),
            // floor modulo takes the sign of a positive divisor
            Atom::Mod(_, b) => b.is_positive(self),
        }
    }

    pub fn with_nonneg_var(mut self, name: impl Into<String>) -> Self {
        self.nonneg_vars.insert(name.into());
        self
    }
}

/// Mapping from dimension-symbol name to its symbol, built from parameter shapes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    symbols: BTreeMap<String, ShapeSymbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every distinct symbol appearing in the given array shapes
    pub fn from_types<'a>(types: impl IntoIterator<Item = &'a ArrayType>) -> Self {
        let mut table = Self::new();
        for ty in types {
            for dim in &ty.shape {
                for name in dim.free_symbols() {
                    table
                        .symbols
                        .entry(name.clone())
                        .or_insert_with(|| ShapeSymbol::positive(name));
                }
            }
        }
        table
    }

    pub fn get(&self, name: &str) -> Option<&ShapeSymbol> {
        self.symbols.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ShapeSymbol)> {
        self.symbols.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.symbols.keys().map(String::as_str)
    }

    /// Base assumptions: every positive symbol
    pub fn assumptions(&self) -> Assumptions {
        Assumptions {
            positive_symbols: self
                .symbols
                .values()
                .filter(|s| s.positive)
                .map(|s| s.name.clone())
                .collect(),
            nonneg_vars: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn m() -> SymExpr {
        SymExpr::symbol("M")
    }

    fn n() -> SymExpr {
        SymExpr::symbol("N")
    }

    fn asm() -> Assumptions {
        Assumptions {
            positive_symbols: ["M", "N"].iter().map(|s| s.to_string()).collect(),
            nonneg_vars: BTreeSet::new(),
        }
    }

    #[test]
    fn test_like_terms_collect() {
        let expr = m()
            .add(&m())
            .and_then(|e| e.add(&SymExpr::int(3)))
            .and_then(|e| e.sub(&SymExpr::int(3)))
            .unwrap();
        assert_eq!(Some(expr.clone()), SymExpr::int(2).mul(&m()));
        assert_eq!(expr.to_string(), "2*M");
    }

    #[test]
    fn test_divisibility_folding() {
        let two_m = SymExpr::int(2).mul(&m()).unwrap();
        assert_eq!(two_m.floor_div(&SymExpr::int(2)), Some(m()));
        assert_eq!(two_m.floor_mod(&SymExpr::int(2)), Some(SymExpr::zero()));

        let odd = two_m.add(&SymExpr::int(1)).unwrap();
        let halved = odd.floor_div(&SymExpr::int(2)).unwrap();
        assert!(!halved.is_const());
        assert_eq!(halved.to_string(), "(2*M + 1) // 2");
    }

    #[test]
    fn test_python_floor_semantics() {
        assert_eq!(SymExpr::int(-7).floor_div(&SymExpr::int(2)), Some(SymExpr::int(-4)));
        assert_eq!(SymExpr::int(-7).floor_mod(&SymExpr::int(2)), Some(SymExpr::int(1)));
        assert_eq!(SymExpr::int(7).floor_mod(&SymExpr::int(-2)), Some(SymExpr::int(-1)));
        assert_eq!(SymExpr::int(1).floor_div(&SymExpr::zero()), None);
    }

    #[test]
    fn test_overflow_is_reported_not_wrapped() {
        let max = SymExpr::int(i64::MAX);
        let min = SymExpr::int(i64::MIN);

        assert_eq!(max.add(&SymExpr::int(1)), None);
        assert_eq!(min.sub(&SymExpr::int(1)), None);
        assert_eq!(min.neg(), None);
        assert_eq!(max.mul(&SymExpr::int(2)), None);
        assert_eq!(m().mul(&max).and_then(|e| e.mul(&SymExpr::int(2))), None);
        assert_eq!(min.floor_div(&SymExpr::int(-1)), None);
        assert_eq!(min.floor_mod(&SymExpr::int(-1)), Some(SymExpr::zero()));

        // cancellation back into range is still fine
        let back = max.add(&m()).and_then(|e| e.sub(&m()));
        assert_eq!(back, Some(max.clone()));

        // unprovable rather than wrong
        let asm = asm();
        assert!(!min.is_negative(&asm));
        assert!(!max.provably_ge(&min, &asm));
        assert_eq!(min.to_string(), "-9223372036854775808");
    }

    #[test]
    fn test_signs() {
        let asm = asm();
        let m_minus = |k: i64| m().sub(&SymExpr::int(k)).unwrap();
        assert!(m().is_positive(&asm));
        assert!(m_minus(1).is_nonneg(&asm));
        assert!(!m_minus(2).is_nonneg(&asm));
        assert!(!m().sub(&n()).unwrap().is_nonneg(&asm));
        assert!(SymExpr::int(-1).is_negative(&asm));
        assert!(m().provably_lt(&m().add(&SymExpr::int(1)).unwrap(), &asm));

        let i = SymExpr::var("i", DType::Int64);
        assert!(!i.is_nonneg(&asm));
        assert!(i.is_nonneg(&asm.clone().with_nonneg_var("i")));
        assert!(i.floor_mod(&SymExpr::int(4)).unwrap().is_nonneg(&asm));
    }

    #[test]
    fn test_display_order() {
        let expr = n().sub(&SymExpr::int(10)).unwrap();
        assert_eq!(expr.to_string(), "N - 10");
        assert_eq!(SymExpr::int(-3).to_string(), "-3");
        assert_eq!(SymExpr::zero().to_string(), "0");
    }

    #[test]
    fn test_symbol_table_dedups() {
        let a = ArrayType::new(DType::Int32, vec![m(), n()]);
        let b = ArrayType::new(DType::Float32, vec![SymExpr::int(2).mul(&m()).unwrap(), n()]);
        let c = ArrayType::new(DType::Int32, vec![n()]);

        let table = SymbolTable::from_types([&a, &b, &c]);
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["M", "N"]);
        assert!(table.get("M").unwrap().positive);
    }

    #[test]
    fn test_symbol_table_concrete_shapes_are_empty() {
        let a = ArrayType::new(DType::Int32, vec![SymExpr::int(3), SymExpr::int(4)]);
        assert!(SymbolTable::from_types([&a]).is_empty());
    }
}
