//! A small AST for OVN ACL match expressions, modelled instead of built by
//! direct string concatenation so that ACL construction stays testable.
//!
//! Grammar: atoms `field == value`, lists of atoms joined by `||` and
//! wrapped in parens, clauses joined by `&&`. Empty input renders to an
//! empty string, signalling "no ACL should be emitted".

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Ip4Src,
    Ip4Dst,
    TcpDst,
    UdpDst,
    SctpDst,
    Inport,
    Outport,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Field::Ip4Src => "ip4.src",
            Field::Ip4Dst => "ip4.dst",
            Field::TcpDst => "tcp.dst",
            Field::UdpDst => "udp.dst",
            Field::SctpDst => "sctp.dst",
            Field::Inport => "inport",
            Field::Outport => "outport",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ge,
    Le,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Op::Eq => "==",
            Op::Ge => ">=",
            Op::Le => "<=",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Atom {
        field: Field,
        op: Op,
        value: String,
    },
    /// Atoms joined by `||`, wrapped in parentheses once rendered.
    Or(Vec<Expr>),
    /// Clauses joined by `&&`.
    And(Vec<Expr>),
}

impl Expr {
    pub fn atom(field: Field, value: impl Into<String>) -> Self {
        Expr::Atom {
            field,
            op: Op::Eq,
            value: value.into(),
        }
    }

    pub fn cmp(field: Field, op: Op, value: impl Into<String>) -> Self {
        Expr::Atom {
            field,
            op,
            value: value.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Expr::Atom { .. } => false,
            Expr::Or(xs) | Expr::And(xs) => xs.is_empty(),
        }
    }

    /// Render to the OVN match-expression string. An empty `And`/`Or`
    /// renders to the empty string.
    pub fn render(&self) -> String {
        match self {
            Expr::Atom { field, op, value } => format!("{field} {op} {value}"),
            Expr::Or(xs) => render_joined(xs, "||", true),
            Expr::And(xs) => render_joined(xs, "&&", false),
        }
    }
}

fn render_joined(xs: &[Expr], sep: &str, parens: bool) -> String {
    let parts: Vec<String> = xs.iter().map(Expr::render).filter(|s| !s.is_empty()).collect();
    if parts.is_empty() {
        return String::new();
    }
    if parts.len() == 1 {
        return parts.into_iter().next().unwrap();
    }
    let joined = parts.join(&format!(" {sep} "));
    if parens {
        format!("({joined})")
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_atom_renders_bare() {
        let e = Expr::atom(Field::Ip4Dst, "10.244.1.5");
        assert_eq!(e.render(), "ip4.dst == 10.244.1.5");
    }

    #[test]
    fn or_of_atoms_wraps_in_parens() {
        let e = Expr::Or(vec![
            Expr::atom(Field::TcpDst, "80"),
            Expr::atom(Field::TcpDst, "443"),
        ]);
        assert_eq!(e.render(), "(tcp.dst == 80 || tcp.dst == 443)");
    }

    #[test]
    fn and_joins_without_outer_parens() {
        let e = Expr::And(vec![
            Expr::atom(Field::Ip4Dst, "10.244.1.5"),
            Expr::atom(Field::Ip4Src, "10.244.2.0/24"),
            Expr::atom(Field::TcpDst, "80"),
        ]);
        assert_eq!(
            e.render(),
            "ip4.dst == 10.244.1.5 && ip4.src == 10.244.2.0/24 && tcp.dst == 80"
        );
    }

    #[test]
    fn range_clause_uses_ge_le() {
        let e = Expr::And(vec![
            Expr::cmp(Field::TcpDst, Op::Ge, "8000"),
            Expr::cmp(Field::TcpDst, Op::Le, "9000"),
        ]);
        assert_eq!(e.render(), "tcp.dst >= 8000 && tcp.dst <= 9000");
    }

    #[test]
    fn empty_and_renders_empty_string() {
        assert_eq!(Expr::And(vec![]).render(), "");
    }

    #[test]
    fn nested_or_inside_and_matches_s5_scenario() {
        let e = Expr::And(vec![
            Expr::atom(Field::Ip4Dst, "10.244.1.5"),
            Expr::atom(Field::Ip4Src, "10.244.2.0/24"),
            Expr::atom(Field::TcpDst, "80"),
        ]);
        assert_eq!(
            e.render(),
            "ip4.dst == 10.244.1.5 && ip4.src == 10.244.2.0/24 && tcp.dst == 80"
        );
    }
}
