
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

pub mod ast;
pub mod bindings;
pub mod cfg;
pub mod compile;
pub mod container;
pub mod decompile;
pub mod error;
pub mod events;
pub mod instr;
pub mod opcode;
pub mod unit;
pub mod vm;

pub use ast::{Expr, FunctionDef, Module, Param, Stmt};
pub use bindings::BindingMap;
pub use container::{Container, read_container, write_container};
pub use decompile::{decompile_module, decompile_unit};
pub use error::DeslateError;
pub use events::NamespaceChange;
pub use unit::CodeUnit;
pub use vm::{Namespace, Value, call_function, run_unit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecompileMode {
    Source,
    Disasm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub mode: DecompileMode,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self { mode: DecompileMode::Source }
    }
}

/// Recovers the definition of a live function value.
///
/// Only values that carry an inspectable code unit can be decompiled;
/// native functions and plain values are `NotDecompilable`. Defaulted
/// parameters come back with `<param>_default` placeholder expressions,
/// to be bound again through a [`BindingMap`] at [`recompile`] time.
pub fn decompile(value: &Value) -> Result<FunctionDef, DeslateError> {
    let func = match value {
        Value::Function(f) => f,
        Value::Native(nf) => {
            return Err(DeslateError::NotDecompilable {
                what: format!("native function '{}'", nf.name),
            });
        }
        other => {
            return Err(DeslateError::NotDecompilable {
                what: format!("{} value", other.type_name()),
            });
        }
    };

    let n_params = func.unit.param_count as usize;
    let n_defaults = func.defaults.len();
    if n_defaults > n_params {
        return Err(DeslateError::NotDecompilable {
            what: format!(
                "function '{}' carrying {n_defaults} defaults for {n_params} parameters",
                func.unit.name
            ),
        });
    }
    let placeholders = func
        .unit
        .varnames
        .iter()
        .take(n_params)
        .skip(n_params - n_defaults)
        .map(|p| Expr::name(bindings::default_placeholder(p)))
        .collect();
    decompile::decompile_unit(&func.unit, placeholders)
}

/// Compiles an edited definition back into a live function value.
///
/// Placeholders referenced by the parameter defaults are resolved through
/// `bindings` first; a referenced parameter the map does not cover is
/// `MissingDefaultBinding`. The definition is then wrapped in a synthetic
/// module unit, compiled, and executed in `ns`, which evaluates the default
/// expressions and binds the definition's name. The placeholder seeds are
/// removed again afterwards, so the name binding is the only entry the
/// caller's namespace keeps.
pub fn recompile(
    def: &FunctionDef,
    origin: &str,
    ns: &mut Namespace,
    bindings: &BindingMap,
) -> Result<Value, DeslateError> {
    let seed = bindings::resolve(def, bindings)?;
    let module = Module { body: vec![Stmt::FunctionDef(def.clone())] };
    let unit = compile::compile_module(&module, origin)?;

    for (name, value) in &seed {
        ns.set(name.clone(), value.clone());
    }
    let executed = vm::run_unit(&unit, ns);
    for (name, _) in &seed {
        ns.remove(name);
    }
    executed?;

    ns.get(&def.name).cloned().ok_or_else(|| {
        DeslateError::exec(format!("recompiled unit left '{}' unbound", def.name))
    })
}

/// Flat listing of a unit and every unit nested beneath it, parents first.
pub fn disassemble_unit(unit: &CodeUnit) -> Result<String, DeslateError> {
    let mut out = String::new();
    push_disasm(unit, &mut out)?;
    Ok(out)
}

fn push_disasm(unit: &CodeUnit, out: &mut String) -> Result<(), DeslateError> {
    let instrs = instr::decode_instructions(unit)?;
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(&instr::disassemble_instrs(unit, &instrs));
    for nested in &unit.nested {
        push_disasm(nested, out)?;
    }
    Ok(())
}

/// Reads a container from `input` and writes the reconstructed module
/// source to `output`.
pub fn decompile_container<R: Read, W: Write>(input: R, output: W) -> Result<(), DeslateError> {
    decompile_container_with_options(input, output, DecompileOptions::default())
}

pub fn decompile_container_with_options<R: Read, W: Write>(
    input: R,
    mut output: W,
    options: DecompileOptions,
) -> Result<(), DeslateError> {
    let container = container::read_container(input)?;
    let text = match options.mode {
        DecompileMode::Source => decompile::decompile_module(&container.unit)?.to_string(),
        DecompileMode::Disasm => disassemble_unit(&container.unit)?,
    };
    output.write_all(text.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_source_module(module: &Module) -> Namespace {
        let unit = compile::compile_module(module, "<test>").unwrap();
        let mut ns = Namespace::with_builtins();
        vm::run_unit(&unit, &mut ns).unwrap();
        ns
    }

    #[test]
    fn native_functions_are_not_decompilable() {
        let ns = Namespace::with_builtins();
        let len = ns.get("len").cloned().unwrap();
        let err = decompile(&len).unwrap_err();
        assert!(err.to_string().contains("native function 'len'"), "{err}");
    }

    #[test]
    fn plain_values_are_not_decompilable() {
        let err = decompile(&Value::Int(3)).unwrap_err();
        assert!(matches!(err, DeslateError::NotDecompilable { .. }), "{err}");
    }

    #[test]
    fn defaulted_parameters_come_back_as_placeholders() {
        let module = Module {
            body: vec![Stmt::FunctionDef(FunctionDef {
                name: "f".into(),
                params: vec![
                    Param { name: "a".into(), default: None },
                    Param { name: "b".into(), default: Some(Expr::int(2)) },
                ],
                body: vec![Stmt::Return { value: Some(Expr::name("a")), line: 2 }],
                line: 1,
            })],
        };
        let ns = run_source_module(&module);
        let f = ns.get("f").cloned().unwrap();

        let def = decompile(&f).unwrap();
        assert_eq!(def.params[0].default, None);
        assert_eq!(def.params[1].default, Some(Expr::name("b_default")));
    }

    #[test]
    fn recompile_leaves_only_the_definition_behind() {
        let def = FunctionDef {
            name: "f".into(),
            params: vec![Param {
                name: "x".into(),
                default: Some(Expr::name("x_default")),
            }],
            body: vec![Stmt::Return { value: Some(Expr::name("x")), line: 2 }],
            line: 1,
        };
        let mut ns = Namespace::with_builtins();
        let bindings = BindingMap::new().bind("x", Value::Int(9));

        let f = recompile(&def, "<edit>", &mut ns, &bindings).unwrap();
        assert!(!ns.contains("x_default"));
        assert_eq!(call_function(&f, &[], &mut ns).unwrap(), Value::Int(9));
    }

    #[test]
    fn recompile_does_not_touch_the_namespace_on_a_missing_binding() {
        let def = FunctionDef {
            name: "f".into(),
            params: vec![Param {
                name: "x".into(),
                default: Some(Expr::name("x_default")),
            }],
            body: vec![Stmt::Return { value: None, line: 2 }],
            line: 1,
        };
        let mut ns = Namespace::new();

        let err = recompile(&def, "<edit>", &mut ns, &BindingMap::new()).unwrap_err();
        assert!(matches!(err, DeslateError::MissingDefaultBinding { ref param } if param == "x"));
        assert!(!ns.contains("f"));
        assert!(!ns.contains("x_default"));
    }

    #[test]
    fn disassembly_lists_nested_units_after_their_parent() {
        let module = Module {
            body: vec![Stmt::FunctionDef(FunctionDef {
                name: "inner".into(),
                params: Vec::new(),
                body: vec![Stmt::Return { value: None, line: 2 }],
                line: 1,
            })],
        };
        let unit = compile::compile_module(&module, "<test>").unwrap();

        let listing = disassemble_unit(&unit).unwrap();
        let parent = listing.find("unit <module>").unwrap();
        let nested = listing.find("unit inner").unwrap();
        assert!(parent < nested, "{listing}");
    }

    #[test]
    fn source_and_disasm_container_modes_differ() {
        let module = Module {
            body: vec![Stmt::Assign {
                target: Expr::name("x"),
                value: Expr::int(1),
                line: 1,
            }],
        };
        let unit = compile::compile_module(&module, "<test>").unwrap();
        let bytes = container::container_bytes(&unit, 0);

        let mut source = Vec::new();
        decompile_container(&bytes[..], &mut source).unwrap();
        assert_eq!(String::from_utf8(source).unwrap(), "x = 1\n");

        let mut disasm = Vec::new();
        decompile_container_with_options(
            &bytes[..],
            &mut disasm,
            DecompileOptions { mode: DecompileMode::Disasm },
        )
        .unwrap();
        let listing = String::from_utf8(disasm).unwrap();
        assert!(listing.contains("load_const"), "{listing}");
        assert!(listing.contains("store_name"), "{listing}");
    }
}
