use std::fmt;

use serde::{Deserialize, Serialize};

use crate::unit::Const;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOp {
    pub fn code(self) -> u8 {
        match self {
            BinOp::Add => 0,
            BinOp::Sub => 1,
            BinOp::Mul => 2,
            BinOp::Div => 3,
            BinOp::FloorDiv => 4,
            BinOp::Mod => 5,
            BinOp::Pow => 6,
        }
    }

    pub fn from_code(c: u8) -> Option<BinOp> {
        Some(match c {
            0 => BinOp::Add,
            1 => BinOp::Sub,
            2 => BinOp::Mul,
            3 => BinOp::Div,
            4 => BinOp::FloorDiv,
            5 => BinOp::Mod,
            6 => BinOp::Pow,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
        }
    }

    fn prec(self) -> u8 {
        match self {
            BinOp::Add | BinOp::Sub => 5,
            BinOp::Mul | BinOp::Div | BinOp::FloorDiv | BinOp::Mod => 6,
            BinOp::Pow => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl UnaryOp {
    pub fn code(self) -> u8 {
        match self {
            UnaryOp::Neg => 0,
            UnaryOp::Not => 1,
        }
    }

    pub fn from_code(c: u8) -> Option<UnaryOp> {
        Some(match c {
            0 => UnaryOp::Neg,
            1 => UnaryOp::Not,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl CmpOp {
    pub fn code(self) -> u8 {
        match self {
            CmpOp::Eq => 0,
            CmpOp::Ne => 1,
            CmpOp::Lt => 2,
            CmpOp::Le => 3,
            CmpOp::Gt => 4,
            CmpOp::Ge => 5,
            CmpOp::In => 6,
            CmpOp::NotIn => 7,
        }
    }

    pub fn from_code(c: u8) -> Option<CmpOp> {
        Some(match c {
            0 => CmpOp::Eq,
            1 => CmpOp::Ne,
            2 => CmpOp::Lt,
            3 => CmpOp::Le,
            4 => CmpOp::Gt,
            5 => CmpOp::Ge,
            6 => CmpOp::In,
            7 => CmpOp::NotIn,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolOpKind {
    And,
    Or,
}

/// Source-level expression. Built bottom-up by the abstract stack walk;
/// every variant has a direct surface spelling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Name(String),
    Literal(Const),
    BinOp { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    UnaryOp { op: UnaryOp, operand: Box<Expr> },
    Compare { op: CmpOp, left: Box<Expr>, right: Box<Expr> },
    BoolOp { op: BoolOpKind, values: Vec<Expr> },
    Call { func: Box<Expr>, args: Vec<Expr> },
    Attribute { value: Box<Expr>, attr: String },
    Subscript { value: Box<Expr>, index: Box<Expr> },
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    ListComp { elt: Box<Expr>, target: String, iter: Box<Expr>, ifs: Vec<Expr> },
}

impl Expr {
    pub fn name(s: impl Into<String>) -> Expr {
        Expr::Name(s.into())
    }

    pub fn int(v: i64) -> Expr {
        Expr::Literal(Const::Int(v))
    }

    pub fn string(s: impl Into<String>) -> Expr {
        Expr::Literal(Const::Str(s.into()))
    }

    pub fn call(func: Expr, args: Vec<Expr>) -> Expr {
        Expr::Call { func: Box::new(func), args }
    }

    fn prec(&self) -> u8 {
        match self {
            Expr::BoolOp { op: BoolOpKind::Or, .. } => 1,
            Expr::BoolOp { op: BoolOpKind::And, .. } => 2,
            Expr::UnaryOp { op: UnaryOp::Not, .. } => 3,
            Expr::Compare { .. } => 4,
            Expr::BinOp { op, .. } => op.prec(),
            Expr::UnaryOp { op: UnaryOp::Neg, .. } => 7,
            Expr::Call { .. } | Expr::Attribute { .. } | Expr::Subscript { .. } => 9,
            Expr::Name(_) | Expr::Literal(_) | Expr::List(_) | Expr::Tuple(_) | Expr::ListComp { .. } => 10,
        }
    }

    fn fmt_prec(&self, f: &mut fmt::Formatter<'_>, min: u8) -> fmt::Result {
        let prec = self.prec();
        if prec < min {
            write!(f, "(")?;
        }
        match self {
            Expr::Name(n) => write!(f, "{n}")?,
            Expr::Literal(c) => write!(f, "{c}")?,
            Expr::BinOp { op, left, right } => {
                // Left-associative except **, which associates right.
                let (lp, rp) = if *op == BinOp::Pow { (prec + 1, prec) } else { (prec, prec + 1) };
                left.fmt_prec(f, lp)?;
                write!(f, " {} ", op.symbol())?;
                right.fmt_prec(f, rp)?;
            }
            Expr::UnaryOp { op: UnaryOp::Neg, operand } => {
                write!(f, "-")?;
                operand.fmt_prec(f, prec)?;
            }
            Expr::UnaryOp { op: UnaryOp::Not, operand } => {
                write!(f, "not ")?;
                operand.fmt_prec(f, prec)?;
            }
            Expr::Compare { op, left, right } => {
                left.fmt_prec(f, prec + 1)?;
                write!(f, " {} ", op.symbol())?;
                right.fmt_prec(f, prec + 1)?;
            }
            Expr::BoolOp { op, values } => {
                let sym = match op {
                    BoolOpKind::And => "and",
                    BoolOpKind::Or => "or",
                };
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {sym} ")?;
                    }
                    v.fmt_prec(f, prec + 1)?;
                }
            }
            Expr::Call { func, args } => {
                func.fmt_prec(f, prec)?;
                write!(f, "(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    a.fmt_prec(f, 0)?;
                }
                write!(f, ")")?;
            }
            Expr::Attribute { value, attr } => {
                value.fmt_prec(f, prec)?;
                write!(f, ".{attr}")?;
            }
            Expr::Subscript { value, index } => {
                value.fmt_prec(f, prec)?;
                write!(f, "[")?;
                index.fmt_prec(f, 0)?;
                write!(f, "]")?;
            }
            Expr::List(items) => {
                write!(f, "[")?;
                for (i, it) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    it.fmt_prec(f, 0)?;
                }
                write!(f, "]")?;
            }
            Expr::Tuple(items) => {
                write!(f, "(")?;
                for (i, it) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    it.fmt_prec(f, 0)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")?;
            }
            Expr::ListComp { elt, target, iter, ifs } => {
                write!(f, "[")?;
                elt.fmt_prec(f, 0)?;
                write!(f, " for {target} in ")?;
                iter.fmt_prec(f, 0)?;
                for cond in ifs {
                    write!(f, " if ")?;
                    cond.fmt_prec(f, 0)?;
                }
                write!(f, "]")?;
            }
        }
        if prec < min {
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_prec(f, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptHandler {
    pub typ: Option<Expr>,
    pub name: Option<String>,
    pub body: Vec<Stmt>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Expr { value: Expr, line: u32 },
    Assign { target: Expr, value: Expr, line: u32 },
    Return { value: Option<Expr>, line: u32 },
    Raise { exc: Option<Expr>, line: u32 },
    If { test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt>, line: u32 },
    While { test: Expr, body: Vec<Stmt>, line: u32 },
    Break { line: u32 },
    Continue { line: u32 },
    Try { body: Vec<Stmt>, handlers: Vec<ExceptHandler>, finalbody: Vec<Stmt>, line: u32 },
    FunctionDef(FunctionDef),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Module {
    pub body: Vec<Stmt>,
}

fn write_params(f: &mut fmt::Formatter<'_>, params: &[Param]) -> fmt::Result {
    for (i, p) in params.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", p.name)?;
        if let Some(d) = &p.default {
            write!(f, "={d}")?;
        }
    }
    Ok(())
}

fn write_block(f: &mut fmt::Formatter<'_>, stmts: &[Stmt], indent: usize) -> fmt::Result {
    let pad = " ".repeat(indent);
    if stmts.is_empty() {
        return writeln!(f, "{pad}pass");
    }
    for s in stmts {
        match s {
            Stmt::Expr { value, .. } => writeln!(f, "{pad}{value}")?,
            Stmt::Assign { target, value, .. } => writeln!(f, "{pad}{target} = {value}")?,
            Stmt::Return { value: Some(v), .. } => writeln!(f, "{pad}return {v}")?,
            Stmt::Return { value: None, .. } => writeln!(f, "{pad}return")?,
            Stmt::Raise { exc: Some(e), .. } => writeln!(f, "{pad}raise {e}")?,
            Stmt::Raise { exc: None, .. } => writeln!(f, "{pad}raise")?,
            Stmt::Break { .. } => writeln!(f, "{pad}break")?,
            Stmt::Continue { .. } => writeln!(f, "{pad}continue")?,
            Stmt::If { test, body, orelse, .. } => {
                writeln!(f, "{pad}if {test}:")?;
                write_block(f, body, indent + 4)?;
                let mut orelse = orelse;
                // Collapse else-of-a-single-if into elif chains.
                loop {
                    match orelse.as_slice() {
                        [] => break,
                        [Stmt::If { test, body, orelse: inner, .. }] => {
                            writeln!(f, "{pad}elif {test}:")?;
                            write_block(f, body, indent + 4)?;
                            orelse = inner;
                        }
                        _ => break,
                    }
                }
                if !orelse.is_empty() {
                    writeln!(f, "{pad}else:")?;
                    write_block(f, orelse, indent + 4)?;
                }
            }
            Stmt::While { test, body, .. } => {
                writeln!(f, "{pad}while {test}:")?;
                write_block(f, body, indent + 4)?;
            }
            Stmt::Try { body, handlers, finalbody, .. } => {
                writeln!(f, "{pad}try:")?;
                write_block(f, body, indent + 4)?;
                for h in handlers {
                    match (&h.typ, &h.name) {
                        (Some(t), Some(n)) => writeln!(f, "{pad}except {t} as {n}:")?,
                        (Some(t), None) => writeln!(f, "{pad}except {t}:")?,
                        (None, _) => writeln!(f, "{pad}except:")?,
                    }
                    write_block(f, &h.body, indent + 4)?;
                }
                if !finalbody.is_empty() {
                    writeln!(f, "{pad}finally:")?;
                    write_block(f, finalbody, indent + 4)?;
                }
            }
            Stmt::FunctionDef(def) => {
                write!(f, "{pad}def {}(", def.name)?;
                write_params(f, &def.params)?;
                writeln!(f, "):")?;
                write_block(f, &def.body, indent + 4)?;
            }
        }
    }
    Ok(())
}

impl fmt::Display for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "def {}(", self.name)?;
        write_params(f, &self.params)?;
        writeln!(f, "):")?;
        write_block(f, &self.body, 4)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_block(f, &self.body, 0)
    }
}

/// Copies statements with every line number zeroed; used where two
/// reconstructions must be compared structurally.
pub fn strip_lines(stmts: &[Stmt]) -> Vec<Stmt> {
    stmts
        .iter()
        .map(|s| match s {
            Stmt::Expr { value, .. } => Stmt::Expr { value: value.clone(), line: 0 },
            Stmt::Assign { target, value, .. } => {
                Stmt::Assign { target: target.clone(), value: value.clone(), line: 0 }
            }
            Stmt::Return { value, .. } => Stmt::Return { value: value.clone(), line: 0 },
            Stmt::Raise { exc, .. } => Stmt::Raise { exc: exc.clone(), line: 0 },
            Stmt::If { test, body, orelse, .. } => Stmt::If {
                test: test.clone(),
                body: strip_lines(body),
                orelse: strip_lines(orelse),
                line: 0,
            },
            Stmt::While { test, body, .. } => {
                Stmt::While { test: test.clone(), body: strip_lines(body), line: 0 }
            }
            Stmt::Break { .. } => Stmt::Break { line: 0 },
            Stmt::Continue { .. } => Stmt::Continue { line: 0 },
            Stmt::Try { body, handlers, finalbody, .. } => Stmt::Try {
                body: strip_lines(body),
                handlers: handlers
                    .iter()
                    .map(|h| ExceptHandler {
                        typ: h.typ.clone(),
                        name: h.name.clone(),
                        body: strip_lines(&h.body),
                        line: 0,
                    })
                    .collect(),
                finalbody: strip_lines(finalbody),
                line: 0,
            },
            Stmt::FunctionDef(d) => Stmt::FunctionDef(FunctionDef {
                name: d.name.clone(),
                params: d.params.clone(),
                body: strip_lines(&d.body),
                line: 0,
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_drops_redundant_parens() {
        // a + b * c
        let e = Expr::BinOp {
            op: BinOp::Add,
            left: Box::new(Expr::name("a")),
            right: Box::new(Expr::BinOp {
                op: BinOp::Mul,
                left: Box::new(Expr::name("b")),
                right: Box::new(Expr::name("c")),
            }),
        };
        assert_eq!(e.to_string(), "a + b * c");

        // (a + b) * c
        let e = Expr::BinOp {
            op: BinOp::Mul,
            left: Box::new(Expr::BinOp {
                op: BinOp::Add,
                left: Box::new(Expr::name("a")),
                right: Box::new(Expr::name("b")),
            }),
            right: Box::new(Expr::name("c")),
        };
        assert_eq!(e.to_string(), "(a + b) * c");
    }

    #[test]
    fn subtraction_keeps_right_operand_parens() {
        // a - (b - c)
        let e = Expr::BinOp {
            op: BinOp::Sub,
            left: Box::new(Expr::name("a")),
            right: Box::new(Expr::BinOp {
                op: BinOp::Sub,
                left: Box::new(Expr::name("b")),
                right: Box::new(Expr::name("c")),
            }),
        };
        assert_eq!(e.to_string(), "a - (b - c)");
    }

    #[test]
    fn bool_chains_render_flat() {
        let e = Expr::BoolOp {
            op: BoolOpKind::And,
            values: vec![Expr::name("a"), Expr::name("b"), Expr::name("c")],
        };
        assert_eq!(e.to_string(), "a and b and c");

        let e = Expr::UnaryOp { op: UnaryOp::Not, operand: Box::new(Expr::name("a")) };
        assert_eq!(e.to_string(), "not a");
    }

    #[test]
    fn function_def_renders_defaults_and_body() {
        let def = FunctionDef {
            name: "f".into(),
            params: vec![
                Param { name: "x".into(), default: None },
                Param { name: "y".into(), default: Some(Expr::name("y_default")) },
            ],
            body: vec![Stmt::Return {
                value: Some(Expr::BinOp {
                    op: BinOp::Add,
                    left: Box::new(Expr::name("x")),
                    right: Box::new(Expr::name("y")),
                }),
                line: 2,
            }],
            line: 1,
        };
        assert_eq!(def.to_string(), "def f(x, y=y_default):\n    return x + y\n");
    }

    #[test]
    fn elif_chains_collapse() {
        let s = Stmt::If {
            test: Expr::name("a"),
            body: vec![Stmt::Return { value: Some(Expr::int(1)), line: 0 }],
            orelse: vec![Stmt::If {
                test: Expr::name("b"),
                body: vec![Stmt::Return { value: Some(Expr::int(2)), line: 0 }],
                orelse: vec![Stmt::Return { value: Some(Expr::int(3)), line: 0 }],
                line: 0,
            }],
            line: 0,
        };
        let m = Module { body: vec![s] };
        assert_eq!(
            m.to_string(),
            "if a:\n    return 1\nelif b:\n    return 2\nelse:\n    return 3\n"
        );
    }

    #[test]
    fn comprehension_renders_with_filters() {
        let e = Expr::ListComp {
            elt: Box::new(Expr::BinOp {
                op: BinOp::Mul,
                left: Box::new(Expr::name("i")),
                right: Box::new(Expr::int(2)),
            }),
            target: "i".into(),
            iter: Box::new(Expr::name("xs")),
            ifs: vec![Expr::Compare {
                op: CmpOp::Gt,
                left: Box::new(Expr::name("i")),
                right: Box::new(Expr::int(0)),
            }],
        };
        assert_eq!(e.to_string(), "[i * 2 for i in xs if i > 0]");
    }

    #[test]
    fn strip_lines_zeroes_nested_statements() {
        let s = Stmt::While {
            test: Expr::name("a"),
            body: vec![Stmt::Break { line: 7 }],
            line: 3,
        };
        let stripped = strip_lines(&[s]);
        assert_eq!(
            stripped,
            vec![Stmt::While {
                test: Expr::name("a"),
                body: vec![Stmt::Break { line: 0 }],
                line: 0,
            }]
        );
    }
}
