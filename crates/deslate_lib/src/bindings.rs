use std::collections::{HashMap, HashSet};

use crate::ast::{Expr, FunctionDef};
use crate::error::DeslateError;
use crate::vm::Value;

/// The symbolic name standing in for a parameter's default value in
/// reconstructed source. Defaults are evaluated at definition time and not
/// kept in the unit's constant pool, so the decompiled parameter list
/// references this name instead of a literal.
pub fn default_placeholder(param: &str) -> String {
    format!("{param}_default")
}

/// Caller-supplied values for placeholder defaults, keyed by parameter
/// name. Never persisted; consulted only while recompiling.
#[derive(Debug, Default)]
pub struct BindingMap {
    entries: HashMap<String, Value>,
}

impl BindingMap {
    pub fn new() -> BindingMap {
        BindingMap { entries: HashMap::new() }
    }

    /// Chainable insert, for building a map in one expression.
    pub fn bind(mut self, param: impl Into<String>, value: Value) -> BindingMap {
        self.entries.insert(param.into(), value);
        self
    }

    pub fn insert(&mut self, param: impl Into<String>, value: Value) {
        self.entries.insert(param.into(), value);
    }

    pub fn get(&self, param: &str) -> Option<&Value> {
        self.entries.get(param)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Namespace seed for every placeholder referenced by the definition's
/// parameter defaults: `(placeholder name, bound value)` pairs. A referenced
/// placeholder with no entry in the map is `MissingDefaultBinding` naming
/// the parameter; map entries nothing references are ignored.
pub fn resolve(
    def: &FunctionDef,
    bindings: &BindingMap,
) -> Result<Vec<(String, Value)>, DeslateError> {
    let placeholders: HashMap<String, &str> = def
        .params
        .iter()
        .map(|p| (default_placeholder(&p.name), p.name.as_str()))
        .collect();

    let mut seed: Vec<(String, Value)> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for p in &def.params {
        let Some(default) = &p.default else { continue };
        let mut missing: Option<String> = None;
        walk_names(default, &mut |name| {
            let Some(&param) = placeholders.get(name) else { return };
            if !seen.insert(param) {
                return;
            }
            match bindings.get(param) {
                Some(v) => seed.push((default_placeholder(param), v.clone())),
                None => {
                    if missing.is_none() {
                        missing = Some(param.to_string());
                    }
                }
            }
        });
        if let Some(param) = missing {
            return Err(DeslateError::MissingDefaultBinding { param });
        }
    }
    Ok(seed)
}

fn walk_names(e: &Expr, f: &mut impl FnMut(&str)) {
    match e {
        Expr::Name(n) => f(n),
        Expr::Literal(_) => {}
        Expr::BinOp { left, right, .. } | Expr::Compare { left, right, .. } => {
            walk_names(left, f);
            walk_names(right, f);
        }
        Expr::UnaryOp { operand, .. } => walk_names(operand, f),
        Expr::BoolOp { values, .. } => {
            for v in values {
                walk_names(v, f);
            }
        }
        Expr::Call { func, args } => {
            walk_names(func, f);
            for a in args {
                walk_names(a, f);
            }
        }
        Expr::Attribute { value, .. } => walk_names(value, f),
        Expr::Subscript { value, index } => {
            walk_names(value, f);
            walk_names(index, f);
        }
        Expr::List(items) | Expr::Tuple(items) => {
            for v in items {
                walk_names(v, f);
            }
        }
        Expr::ListComp { elt, iter, ifs, .. } => {
            walk_names(elt, f);
            walk_names(iter, f);
            for v in ifs {
                walk_names(v, f);
            }
        }
    }
}
