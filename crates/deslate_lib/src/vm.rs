use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};

use crate::ast::{BinOp, CmpOp, UnaryOp};
use crate::error::DeslateError;
use crate::events::{ListenerSet, NamespaceChange};
use crate::opcode::Op;
use crate::unit::{CodeUnit, Const};

const RECURSION_LIMIT: usize = 200;

/// Exception kinds seeded into every builtin namespace. "Exception" is the
/// catch-all; the rest match only their own kind.
pub const EXC_KINDS: &[&str] = &[
    "Exception",
    "ValueError",
    "TypeError",
    "KeyError",
    "IndexError",
    "ZeroDivisionError",
];

pub type NativeFn = fn(&[Value]) -> Result<Value, DeslateError>;

#[derive(Debug, Clone, Copy)]
pub struct NativeFunction {
    pub name: &'static str,
    pub call: NativeFn,
}

#[derive(Debug, Clone)]
pub struct FunctionValue {
    pub unit: Rc<CodeUnit>,
    /// Values for the trailing defaulted parameters, evaluated at def time.
    pub defaults: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExcValue {
    pub kind: String,
    pub message: String,
}

/// Live position of a for_iter loop; sits on the value stack between
/// iterations.
#[derive(Debug)]
pub struct IterState {
    items: Vec<Value>,
    pos: usize,
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Function(Rc<FunctionValue>),
    Native(NativeFunction),
    ExcType(&'static str),
    Exc(Rc<ExcValue>),
    Iter(Rc<RefCell<IterState>>),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Function(_) => "function",
            Value::Native(_) => "native function",
            Value::ExcType(_) => "exception type",
            Value::Exc(_) => "exception",
            Value::Iter(_) => "iterator",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            _ => true,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        value_eq(self, other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Value::Function(func) => write!(f, "<function {}>", func.unit.name),
            Value::Native(nf) => write!(f, "<built-in function {}>", nf.name),
            Value::ExcType(kind) => write!(f, "{kind}"),
            Value::Exc(e) => write!(f, "{}('{}')", e.kind, e.message),
            Value::Iter(_) => write!(f, "<iterator>"),
        }
    }
}

/// Named entries a module executes against: globals, builtins, and whatever
/// the embedder seeds. Bulk edits go through `apply_update` so listeners can
/// veto them; the VM's own store_name writes bypass that path.
pub struct Namespace {
    entries: HashMap<String, Value>,
    listeners: ListenerSet,
}

impl Namespace {
    pub fn new() -> Namespace {
        Namespace { entries: HashMap::new(), listeners: ListenerSet::new() }
    }

    pub fn with_builtins() -> Namespace {
        let mut ns = Namespace::new();
        for nf in NATIVES {
            ns.set(nf.name, Value::Native(*nf));
        }
        for kind in EXC_KINDS {
            ns.set(*kind, Value::ExcType(kind));
        }
        ns
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.entries.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.entries.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn on_change(&mut self, listener: impl FnMut(&mut NamespaceChange) + 'static) {
        self.listeners.register(listener);
    }

    /// Announces a bulk change to every listener, then applies it unless one
    /// of them vetoed. Returns whether the change went through.
    pub fn apply_update(&mut self, mut change: NamespaceChange) -> bool {
        self.listeners.dispatch(&mut change);
        if change.is_vetoed() {
            return false;
        }
        for name in change.removed {
            self.entries.remove(&name);
        }
        for (name, value) in change.added.into_iter().chain(change.modified) {
            self.entries.insert(name, value);
        }
        true
    }
}

impl Default for Namespace {
    fn default() -> Namespace {
        Namespace::new()
    }
}

/// Executes a unit at module scope: store_name/load_name hit the namespace
/// directly, so defs and assignments land in `ns`.
pub fn run_unit(unit: &CodeUnit, ns: &mut Namespace) -> Result<Value, DeslateError> {
    let locals = vec![None; unit.varnames.len()];
    Machine { ns }.run(unit, locals, 0)
}

/// Calls a callable value with positional arguments. Defaults fill the
/// trailing parameters the caller omitted.
pub fn call_function(
    callee: &Value,
    args: &[Value],
    ns: &mut Namespace,
) -> Result<Value, DeslateError> {
    Machine { ns }.call(callee, args.to_vec(), 0)
}

fn raise(kind: &str, message: impl Into<String>) -> DeslateError {
    DeslateError::Uncaught { kind: kind.to_string(), message: message.into() }
}

struct Machine<'a> {
    ns: &'a mut Namespace,
}

impl Machine<'_> {
    fn call(&mut self, callee: &Value, args: Vec<Value>, depth: usize) -> Result<Value, DeslateError> {
        match callee {
            Value::Function(f) => {
                let n_params = f.unit.param_count as usize;
                let required = n_params.checked_sub(f.defaults.len()).ok_or_else(|| {
                    DeslateError::exec(format!(
                        "malformed function '{}': more defaults than parameters",
                        f.unit.name
                    ))
                })?;
                if args.len() < required || args.len() > n_params {
                    return Err(DeslateError::exec(format!(
                        "{}() takes {} argument(s) but {} were given",
                        f.unit.name,
                        n_params,
                        args.len()
                    )));
                }
                let mut locals: Vec<Option<Value>> = vec![None; f.unit.varnames.len()];
                let supplied = args.len();
                for (i, a) in args.into_iter().enumerate() {
                    locals[i] = Some(a);
                }
                for i in supplied..n_params {
                    locals[i] = Some(f.defaults[i - required].clone());
                }
                self.run(&f.unit, locals, depth + 1)
            }
            Value::Native(nf) => (nf.call)(&args),
            Value::ExcType(kind) => {
                let message = match args.as_slice() {
                    [] => String::new(),
                    [Value::Str(s)] => s.clone(),
                    [other] => other.to_string(),
                    _ => {
                        return Err(DeslateError::exec(format!(
                            "{kind}() takes at most one argument"
                        )));
                    }
                };
                Ok(Value::Exc(Rc::new(ExcValue { kind: kind.to_string(), message })))
            }
            other => {
                Err(DeslateError::exec(format!("'{}' value is not callable", other.type_name())))
            }
        }
    }

    fn run(
        &mut self,
        unit: &CodeUnit,
        mut locals: Vec<Option<Value>>,
        depth: usize,
    ) -> Result<Value, DeslateError> {
        if depth > RECURSION_LIMIT {
            return Err(DeslateError::exec("recursion limit exceeded"));
        }
        let mut stack: Vec<Value> = Vec::new();
        let mut pc = 0usize;
        loop {
            if pc >= unit.code.len() {
                return Err(DeslateError::exec(format!(
                    "execution ran past the end of '{}'",
                    unit.name
                )));
            }
            let at = pc;
            match self.step(unit, at, &mut pc, &mut stack, &mut locals, depth) {
                Ok(Some(ret)) => return Ok(ret),
                Ok(None) => {}
                Err(DeslateError::Uncaught { kind, message }) => {
                    // Innermost protected region covering the faulting
                    // instruction wins; handler enters with just the
                    // exception on the stack.
                    match innermost_handler(unit, at) {
                        Some(handler) => {
                            stack.clear();
                            stack.push(Value::Exc(Rc::new(ExcValue { kind, message })));
                            pc = handler;
                        }
                        None => return Err(DeslateError::Uncaught { kind, message }),
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn step(
        &mut self,
        unit: &CodeUnit,
        at: usize,
        pc: &mut usize,
        stack: &mut Vec<Value>,
        locals: &mut [Option<Value>],
        depth: usize,
    ) -> Result<Option<Value>, DeslateError> {
        let code = &unit.code;
        let byte = code[at];
        *pc = at + 1;
        let op = Op::from_byte(byte)
            .ok_or(DeslateError::UnsupportedOpcode { offset: at, opcode: byte })?;
        match op {
            Op::Nop => {}
            Op::PopTop => {
                pop(stack, at)?;
            }
            Op::DupTop => {
                let top = pop(stack, at)?;
                stack.push(top.clone());
                stack.push(top);
            }
            Op::RotTwo => {
                let a = pop(stack, at)?;
                let b = pop(stack, at)?;
                stack.push(a);
                stack.push(b);
            }
            Op::LoadConst => {
                let idx = read_u16(code, pc)?;
                stack.push(const_to_value(unit.const_at(idx as u32)?));
            }
            Op::LoadName => {
                let idx = read_u16(code, pc)?;
                let name = unit.name_at(idx as u32)?;
                match self.ns.get(name) {
                    Some(v) => stack.push(v.clone()),
                    None => {
                        return Err(DeslateError::exec(format!("name '{name}' is not defined")));
                    }
                }
            }
            Op::StoreName => {
                let idx = read_u16(code, pc)?;
                let name = unit.name_at(idx as u32)?.to_string();
                let v = pop(stack, at)?;
                self.ns.set(name, v);
            }
            Op::LoadFast => {
                let idx = read_u16(code, pc)?;
                let name = unit.varname_at(idx as u32)?;
                match locals.get(idx as usize).and_then(Option::as_ref) {
                    Some(v) => stack.push(v.clone()),
                    None => {
                        return Err(DeslateError::exec(format!(
                            "local '{name}' referenced before assignment"
                        )));
                    }
                }
            }
            Op::StoreFast => {
                let idx = read_u16(code, pc)?;
                unit.varname_at(idx as u32)?;
                locals[idx as usize] = Some(pop(stack, at)?);
            }
            Op::LoadAttr => {
                let idx = read_u16(code, pc)?;
                let attr = unit.name_at(idx as u32)?;
                let v = pop(stack, at)?;
                stack.push(attr_get(&v, attr)?);
            }
            Op::LoadSubscr => {
                let index = pop(stack, at)?;
                let obj = pop(stack, at)?;
                stack.push(subscr_get(&obj, &index)?);
            }
            Op::StoreSubscr => {
                let index = pop(stack, at)?;
                let obj = pop(stack, at)?;
                let value = pop(stack, at)?;
                subscr_set(&obj, &index, value)?;
            }
            Op::BinaryOp => {
                let sub = read_u8(code, pc)?;
                let op = BinOp::from_code(sub)
                    .ok_or_else(|| DeslateError::exec("invalid binary operator code"))?;
                let r = pop(stack, at)?;
                let l = pop(stack, at)?;
                stack.push(binary_op(op, &l, &r)?);
            }
            Op::UnaryOp => {
                let sub = read_u8(code, pc)?;
                let op = UnaryOp::from_code(sub)
                    .ok_or_else(|| DeslateError::exec("invalid unary operator code"))?;
                let v = pop(stack, at)?;
                stack.push(unary_op(op, &v)?);
            }
            Op::CompareOp => {
                let sub = read_u8(code, pc)?;
                let op = CmpOp::from_code(sub)
                    .ok_or_else(|| DeslateError::exec("invalid comparison operator code"))?;
                let r = pop(stack, at)?;
                let l = pop(stack, at)?;
                stack.push(Value::Bool(compare_op(op, &l, &r)?));
            }
            Op::Jump => {
                *pc = read_u16(code, pc)? as usize;
            }
            Op::PopJumpIfFalse => {
                let t = read_u16(code, pc)? as usize;
                if !pop(stack, at)?.is_truthy() {
                    *pc = t;
                }
            }
            Op::PopJumpIfTrue => {
                let t = read_u16(code, pc)? as usize;
                if pop(stack, at)?.is_truthy() {
                    *pc = t;
                }
            }
            Op::JumpIfFalseOrPop => {
                let t = read_u16(code, pc)? as usize;
                match stack.last() {
                    Some(v) if !v.is_truthy() => *pc = t,
                    Some(_) => {
                        stack.pop();
                    }
                    None => return Err(DeslateError::StackUnderflow { offset: at }),
                }
            }
            Op::JumpIfTrueOrPop => {
                let t = read_u16(code, pc)? as usize;
                match stack.last() {
                    Some(v) if v.is_truthy() => *pc = t,
                    Some(_) => {
                        stack.pop();
                    }
                    None => return Err(DeslateError::StackUnderflow { offset: at }),
                }
            }
            Op::Call => {
                let argc = read_u8(code, pc)? as usize;
                let args = popn(stack, argc, at)?;
                let callee = pop(stack, at)?;
                let ret = self.call(&callee, args, depth)?;
                stack.push(ret);
            }
            Op::ReturnValue => {
                return Ok(Some(pop(stack, at)?));
            }
            Op::ReturnNone => {
                return Ok(Some(Value::None));
            }
            Op::BuildList => {
                let n = read_u16(code, pc)? as usize;
                let items = popn(stack, n, at)?;
                stack.push(Value::list(items));
            }
            Op::BuildTuple => {
                let n = read_u16(code, pc)? as usize;
                let items = popn(stack, n, at)?;
                stack.push(Value::Tuple(Rc::new(items)));
            }
            Op::GetIter => {
                let v = pop(stack, at)?;
                stack.push(get_iter(v)?);
            }
            Op::ForIter => {
                let t = read_u16(code, pc)? as usize;
                let next = match stack.last() {
                    Some(Value::Iter(state)) => {
                        let mut s = state.borrow_mut();
                        let next = s.items.get(s.pos).cloned();
                        if next.is_some() {
                            s.pos += 1;
                        }
                        next
                    }
                    Some(other) => {
                        return Err(DeslateError::exec(format!(
                            "for_iter on a '{}' value",
                            other.type_name()
                        )));
                    }
                    None => return Err(DeslateError::StackUnderflow { offset: at }),
                };
                match next {
                    Some(v) => stack.push(v),
                    None => {
                        stack.pop();
                        *pc = t;
                    }
                }
            }
            Op::ListAppend => {
                let k = read_u16(code, pc)? as usize;
                let v = pop(stack, at)?;
                let idx = stack
                    .len()
                    .checked_sub(k)
                    .ok_or(DeslateError::StackUnderflow { offset: at })?;
                match &stack[idx] {
                    Value::List(items) => items.borrow_mut().push(v),
                    other => {
                        return Err(DeslateError::exec(format!(
                            "list_append on a '{}' value",
                            other.type_name()
                        )));
                    }
                }
            }
            Op::MakeFunction => {
                let unit_idx = read_u8(code, pc)? as usize;
                let n_defaults = read_u8(code, pc)? as usize;
                let defaults = popn(stack, n_defaults, at)?;
                let nested = unit.nested.get(unit_idx).ok_or_else(|| {
                    DeslateError::exec(format!(
                        "make_function refers to missing nested unit #{unit_idx}"
                    ))
                })?;
                stack.push(Value::Function(Rc::new(FunctionValue {
                    unit: Rc::new(nested.clone()),
                    defaults,
                })));
            }
            Op::Raise => {
                let argc = read_u8(code, pc)?;
                match argc {
                    0 => {
                        return Err(DeslateError::exec("bare raise with no active exception"));
                    }
                    1 => {
                        let v = pop(stack, at)?;
                        return Err(to_exception(&v)?);
                    }
                    _ => {
                        return Err(DeslateError::exec("raise takes at most one operand"));
                    }
                }
            }
            Op::CheckExcMatch => {
                let pat = pop(stack, at)?;
                let exc = match stack.last() {
                    Some(Value::Exc(e)) => e.clone(),
                    Some(other) => {
                        return Err(DeslateError::exec(format!(
                            "check_exc_match against a '{}' value",
                            other.type_name()
                        )));
                    }
                    None => return Err(DeslateError::StackUnderflow { offset: at }),
                };
                match pat {
                    Value::ExcType(kind) => {
                        stack.push(Value::Bool(kind == "Exception" || kind == exc.kind));
                    }
                    other => {
                        return Err(DeslateError::exec(format!(
                            "except pattern is a '{}' value, not an exception type",
                            other.type_name()
                        )));
                    }
                }
            }
            Op::Reraise => {
                let v = pop(stack, at)?;
                return Err(to_exception(&v)?);
            }
        }
        Ok(None)
    }
}

fn innermost_handler(unit: &CodeUnit, at: usize) -> Option<usize> {
    unit.exc_table
        .iter()
        .filter(|e| (e.start as usize) <= at && at < e.end as usize)
        .min_by_key(|e| e.end - e.start)
        .map(|e| e.handler as usize)
}

fn pop(stack: &mut Vec<Value>, at: usize) -> Result<Value, DeslateError> {
    stack.pop().ok_or(DeslateError::StackUnderflow { offset: at })
}

fn popn(stack: &mut Vec<Value>, n: usize, at: usize) -> Result<Vec<Value>, DeslateError> {
    if stack.len() < n {
        return Err(DeslateError::StackUnderflow { offset: at });
    }
    Ok(stack.split_off(stack.len() - n))
}

fn read_u8(code: &[u8], pc: &mut usize) -> Result<u8, DeslateError> {
    let b = code
        .get(*pc)
        .copied()
        .ok_or_else(|| DeslateError::exec("truncated instruction operand"))?;
    *pc += 1;
    Ok(b)
}

fn read_u16(code: &[u8], pc: &mut usize) -> Result<u16, DeslateError> {
    if *pc + 2 > code.len() {
        return Err(DeslateError::exec("truncated instruction operand"));
    }
    let v = LittleEndian::read_u16(&code[*pc..*pc + 2]);
    *pc += 2;
    Ok(v)
}

fn const_to_value(c: &Const) -> Value {
    match c {
        Const::None => Value::None,
        Const::Bool(b) => Value::Bool(*b),
        Const::Int(i) => Value::Int(*i),
        Const::Float(v) => Value::Float(*v),
        Const::Str(s) => Value::Str(s.clone()),
        Const::Tuple(items) => Value::Tuple(Rc::new(items.iter().map(const_to_value).collect())),
    }
}

fn to_exception(v: &Value) -> Result<DeslateError, DeslateError> {
    match v {
        Value::Exc(e) => Ok(raise(&e.kind, e.message.clone())),
        Value::ExcType(kind) => Ok(raise(kind, "")),
        other => Err(DeslateError::exec(format!(
            "'{}' value is not an exception",
            other.type_name()
        ))),
    }
}

fn get_iter(v: Value) -> Result<Value, DeslateError> {
    let items = match &v {
        Value::List(items) => items.borrow().clone(),
        Value::Tuple(items) => items.as_ref().clone(),
        Value::Str(s) => s.chars().map(|c| Value::Str(c.to_string())).collect(),
        Value::Iter(_) => return Ok(v),
        other => {
            return Err(DeslateError::exec(format!(
                "'{}' value is not iterable",
                other.type_name()
            )));
        }
    };
    Ok(Value::Iter(Rc::new(RefCell::new(IterState { items, pos: 0 }))))
}

fn attr_get(v: &Value, attr: &str) -> Result<Value, DeslateError> {
    match (v, attr) {
        (Value::Exc(e), "kind") => Ok(Value::Str(e.kind.clone())),
        (Value::Exc(e), "message") => Ok(Value::Str(e.message.clone())),
        _ => Err(DeslateError::exec(format!(
            "'{}' value has no attribute '{attr}'",
            v.type_name()
        ))),
    }
}

fn norm_index(i: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let i = if i < 0 { i + len } else { i };
    if (0..len).contains(&i) { Some(i as usize) } else { None }
}

fn subscr_get(obj: &Value, index: &Value) -> Result<Value, DeslateError> {
    match (obj, index) {
        (Value::List(items), Value::Int(i)) => {
            let items = items.borrow();
            match norm_index(*i, items.len()) {
                Some(n) => Ok(items[n].clone()),
                None => Err(raise("IndexError", format!("list index {i} out of range"))),
            }
        }
        (Value::Tuple(items), Value::Int(i)) => match norm_index(*i, items.len()) {
            Some(n) => Ok(items[n].clone()),
            None => Err(raise("IndexError", format!("tuple index {i} out of range"))),
        },
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            match norm_index(*i, chars.len()) {
                Some(n) => Ok(Value::Str(chars[n].to_string())),
                None => Err(raise("IndexError", format!("string index {i} out of range"))),
            }
        }
        (Value::List(_) | Value::Tuple(_) | Value::Str(_), other) => Err(DeslateError::exec(
            format!("indices must be integers, not '{}'", other.type_name()),
        )),
        (other, _) => Err(DeslateError::exec(format!(
            "'{}' value is not subscriptable",
            other.type_name()
        ))),
    }
}

fn subscr_set(obj: &Value, index: &Value, value: Value) -> Result<(), DeslateError> {
    match (obj, index) {
        (Value::List(items), Value::Int(i)) => {
            let mut items = items.borrow_mut();
            let len = items.len();
            match norm_index(*i, len) {
                Some(n) => {
                    items[n] = value;
                    Ok(())
                }
                None => Err(raise("IndexError", format!("list index {i} out of range"))),
            }
        }
        (Value::List(_), other) => Err(DeslateError::exec(format!(
            "indices must be integers, not '{}'",
            other.type_name()
        ))),
        (other, _) => Err(DeslateError::exec(format!(
            "'{}' value does not support item assignment",
            other.type_name()
        ))),
    }
}

fn type_error(op: &str, l: &Value, r: &Value) -> DeslateError {
    DeslateError::exec(format!(
        "unsupported operand types for {op}: '{}' and '{}'",
        l.type_name(),
        r.type_name()
    ))
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(x) => Some(*x),
        _ => None,
    }
}

fn floordiv_i64(a: i64, b: i64) -> Option<i64> {
    if a == i64::MIN && b == -1 {
        return None;
    }
    let q = a / b;
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) { Some(q - 1) } else { Some(q) }
}

fn pymod_i64(a: i64, b: i64) -> i64 {
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) { r + b } else { r }
}

fn pymod_f64(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r }
}

fn binary_op(op: BinOp, l: &Value, r: &Value) -> Result<Value, DeslateError> {
    use Value::{Float, Int, List, Str, Tuple};
    match op {
        BinOp::Add => match (l, r) {
            (Int(a), Int(b)) => a
                .checked_add(*b)
                .map(Int)
                .ok_or_else(|| DeslateError::exec("integer overflow in +")),
            (Str(a), Str(b)) => Ok(Str(format!("{a}{b}"))),
            (List(a), List(b)) => {
                let mut out = a.borrow().clone();
                out.extend(b.borrow().iter().cloned());
                Ok(Value::list(out))
            }
            (Tuple(a), Tuple(b)) => {
                let mut out = a.as_ref().clone();
                out.extend(b.iter().cloned());
                Ok(Tuple(Rc::new(out)))
            }
            _ => match (as_f64(l), as_f64(r)) {
                (Some(a), Some(b)) => Ok(Float(a + b)),
                _ => Err(type_error("+", l, r)),
            },
        },
        BinOp::Sub => match (l, r) {
            (Int(a), Int(b)) => a
                .checked_sub(*b)
                .map(Int)
                .ok_or_else(|| DeslateError::exec("integer overflow in -")),
            _ => match (as_f64(l), as_f64(r)) {
                (Some(a), Some(b)) => Ok(Float(a - b)),
                _ => Err(type_error("-", l, r)),
            },
        },
        BinOp::Mul => match (l, r) {
            (Int(a), Int(b)) => a
                .checked_mul(*b)
                .map(Int)
                .ok_or_else(|| DeslateError::exec("integer overflow in *")),
            (Str(s), Int(n)) | (Int(n), Str(s)) => {
                Ok(Str(s.repeat(usize::try_from(*n).unwrap_or(0))))
            }
            (List(items), Int(n)) | (Int(n), List(items)) => {
                let items = items.borrow();
                let n = usize::try_from(*n).unwrap_or(0);
                let mut out = Vec::with_capacity(items.len() * n);
                for _ in 0..n {
                    out.extend(items.iter().cloned());
                }
                Ok(Value::list(out))
            }
            _ => match (as_f64(l), as_f64(r)) {
                (Some(a), Some(b)) => Ok(Float(a * b)),
                _ => Err(type_error("*", l, r)),
            },
        },
        // True division always yields a float, like the source language.
        BinOp::Div => match (as_f64(l), as_f64(r)) {
            (Some(_), Some(b)) if b == 0.0 => Err(raise("ZeroDivisionError", "division by zero")),
            (Some(a), Some(b)) => Ok(Float(a / b)),
            _ => Err(type_error("/", l, r)),
        },
        BinOp::FloorDiv => match (l, r) {
            (Int(_), Int(0)) => Err(raise("ZeroDivisionError", "integer division by zero")),
            (Int(a), Int(b)) => floordiv_i64(*a, *b)
                .map(Int)
                .ok_or_else(|| DeslateError::exec("integer overflow in //")),
            _ => match (as_f64(l), as_f64(r)) {
                (Some(_), Some(b)) if b == 0.0 => {
                    Err(raise("ZeroDivisionError", "float floor division by zero"))
                }
                (Some(a), Some(b)) => Ok(Float((a / b).floor())),
                _ => Err(type_error("//", l, r)),
            },
        },
        BinOp::Mod => match (l, r) {
            (Int(_), Int(0)) => Err(raise("ZeroDivisionError", "integer modulo by zero")),
            (Int(a), Int(b)) => Ok(Int(pymod_i64(*a, *b))),
            _ => match (as_f64(l), as_f64(r)) {
                (Some(_), Some(b)) if b == 0.0 => Err(raise("ZeroDivisionError", "float modulo")),
                (Some(a), Some(b)) => Ok(Float(pymod_f64(a, b))),
                _ => Err(type_error("%", l, r)),
            },
        },
        BinOp::Pow => match (l, r) {
            (Int(a), Int(b)) if *b >= 0 => u32::try_from(*b)
                .ok()
                .and_then(|e| a.checked_pow(e))
                .map(Int)
                .ok_or_else(|| DeslateError::exec("integer overflow in **")),
            _ => match (as_f64(l), as_f64(r)) {
                (Some(a), Some(b)) => Ok(Float(a.powf(b))),
                _ => Err(type_error("**", l, r)),
            },
        },
    }
}

fn unary_op(op: UnaryOp, v: &Value) -> Result<Value, DeslateError> {
    match op {
        UnaryOp::Neg => match v {
            Value::Int(i) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| DeslateError::exec("integer overflow in unary -")),
            Value::Float(x) => Ok(Value::Float(-x)),
            other => Err(DeslateError::exec(format!(
                "bad operand type for unary -: '{}'",
                other.type_name()
            ))),
        },
        UnaryOp::Not => Ok(Value::Bool(!v.is_truthy())),
    }
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => (*x as f64) == *y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            Rc::ptr_eq(x, y) || {
                let (x, y) = (x.borrow(), y.borrow());
                x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| value_eq(a, b))
            }
        }
        (Value::Tuple(x), Value::Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| value_eq(a, b))
        }
        (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
        (Value::Native(x), Value::Native(y)) => x.name == y.name,
        (Value::ExcType(x), Value::ExcType(y)) => x == y,
        (Value::Exc(x), Value::Exc(y)) => Rc::ptr_eq(x, y),
        (Value::Iter(x), Value::Iter(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

fn value_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::List(x), Value::List(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            seq_cmp(x.iter(), y.iter())
        }
        (Value::Tuple(x), Value::Tuple(y)) => seq_cmp(x.iter(), y.iter()),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

fn seq_cmp<'a>(
    mut x: impl Iterator<Item = &'a Value>,
    mut y: impl Iterator<Item = &'a Value>,
) -> Option<Ordering> {
    loop {
        match (x.next(), y.next()) {
            (None, None) => return Some(Ordering::Equal),
            (None, Some(_)) => return Some(Ordering::Less),
            (Some(_), None) => return Some(Ordering::Greater),
            (Some(a), Some(b)) => match value_cmp(a, b)? {
                Ordering::Equal => {}
                other => return Some(other),
            },
        }
    }
}

fn contains(needle: &Value, hay: &Value) -> Result<bool, DeslateError> {
    match hay {
        Value::List(items) => Ok(items.borrow().iter().any(|v| value_eq(v, needle))),
        Value::Tuple(items) => Ok(items.iter().any(|v| value_eq(v, needle))),
        Value::Str(s) => match needle {
            Value::Str(sub) => Ok(s.contains(sub.as_str())),
            other => Err(DeslateError::exec(format!(
                "'in <str>' needs a str operand, not '{}'",
                other.type_name()
            ))),
        },
        other => Err(DeslateError::exec(format!(
            "'{}' value is not a container",
            other.type_name()
        ))),
    }
}

fn compare_op(op: CmpOp, l: &Value, r: &Value) -> Result<bool, DeslateError> {
    let ordering = |l: &Value, r: &Value| {
        value_cmp(l, r).ok_or_else(|| {
            DeslateError::exec(format!(
                "'{}' and '{}' values are not orderable",
                l.type_name(),
                r.type_name()
            ))
        })
    };
    match op {
        CmpOp::Eq => Ok(value_eq(l, r)),
        CmpOp::Ne => Ok(!value_eq(l, r)),
        CmpOp::Lt => Ok(ordering(l, r)? == Ordering::Less),
        CmpOp::Le => Ok(ordering(l, r)? != Ordering::Greater),
        CmpOp::Gt => Ok(ordering(l, r)? == Ordering::Greater),
        CmpOp::Ge => Ok(ordering(l, r)? != Ordering::Less),
        CmpOp::In => contains(l, r),
        CmpOp::NotIn => contains(l, r).map(|b| !b),
    }
}

const NATIVES: &[NativeFunction] = &[
    NativeFunction { name: "len", call: native_len },
    NativeFunction { name: "abs", call: native_abs },
    NativeFunction { name: "min", call: native_min },
    NativeFunction { name: "max", call: native_max },
    NativeFunction { name: "range", call: native_range },
];

fn native_len(args: &[Value]) -> Result<Value, DeslateError> {
    let [v] = args else {
        return Err(DeslateError::exec("len() takes exactly one argument"));
    };
    let n = match v {
        Value::Str(s) => s.chars().count(),
        Value::List(items) => items.borrow().len(),
        Value::Tuple(items) => items.len(),
        other => {
            return Err(DeslateError::exec(format!(
                "'{}' value has no length",
                other.type_name()
            )));
        }
    };
    Ok(Value::Int(n as i64))
}

fn native_abs(args: &[Value]) -> Result<Value, DeslateError> {
    let [v] = args else {
        return Err(DeslateError::exec("abs() takes exactly one argument"));
    };
    match v {
        Value::Int(i) => i
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| DeslateError::exec("integer overflow in abs()")),
        Value::Float(x) => Ok(Value::Float(x.abs())),
        other => Err(DeslateError::exec(format!(
            "bad operand type for abs(): '{}'",
            other.type_name()
        ))),
    }
}

fn extremum(name: &str, args: &[Value], keep: Ordering) -> Result<Value, DeslateError> {
    let items: Vec<Value> = match args {
        [] => return Err(DeslateError::exec(format!("{name}() expects arguments"))),
        [Value::List(items)] => items.borrow().clone(),
        [Value::Tuple(items)] => items.as_ref().clone(),
        _ => args.to_vec(),
    };
    let mut best: Option<Value> = None;
    for v in items {
        best = match best {
            None => Some(v),
            Some(b) => {
                let ord = value_cmp(&v, &b).ok_or_else(|| {
                    DeslateError::exec(format!(
                        "'{}' and '{}' values are not orderable",
                        v.type_name(),
                        b.type_name()
                    ))
                })?;
                Some(if ord == keep { v } else { b })
            }
        };
    }
    best.ok_or_else(|| raise("ValueError", format!("{name}() arg is an empty sequence")))
}

fn native_min(args: &[Value]) -> Result<Value, DeslateError> {
    extremum("min", args, Ordering::Less)
}

fn native_max(args: &[Value]) -> Result<Value, DeslateError> {
    extremum("max", args, Ordering::Greater)
}

fn native_range(args: &[Value]) -> Result<Value, DeslateError> {
    let int_arg = |v: &Value| match v {
        Value::Int(i) => Ok(*i),
        other => Err(DeslateError::exec(format!(
            "range() expects int arguments, got '{}'",
            other.type_name()
        ))),
    };
    let (start, stop, step) = match args {
        [stop] => (0, int_arg(stop)?, 1),
        [start, stop] => (int_arg(start)?, int_arg(stop)?, 1),
        [start, stop, step] => (int_arg(start)?, int_arg(stop)?, int_arg(step)?),
        _ => return Err(DeslateError::exec("range() takes one to three arguments")),
    };
    if step == 0 {
        return Err(raise("ValueError", "range() step must not be zero"));
    }
    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(Value::Int(i));
        i += step;
    }
    Ok(Value::list(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, FunctionDef, Module, Param, Stmt};
    use crate::compile::{compile_function, compile_module};

    fn run_source(src: &Module) -> Namespace {
        let unit = compile_module(src, "<test>").unwrap();
        let mut ns = Namespace::with_builtins();
        run_unit(&unit, &mut ns).unwrap();
        ns
    }

    fn compile_def(def: &FunctionDef) -> Value {
        let unit = compile_function(def, "<test>").unwrap();
        Value::Function(Rc::new(FunctionValue { unit: Rc::new(unit), defaults: Vec::new() }))
    }

    #[test]
    fn arithmetic_follows_source_semantics() {
        let m = Module {
            body: vec![
                Stmt::Assign {
                    target: Expr::name("a"),
                    value: Expr::BinOp {
                        op: crate::ast::BinOp::FloorDiv,
                        left: Box::new(Expr::int(-7)),
                        right: Box::new(Expr::int(2)),
                    },
                    line: 1,
                },
                Stmt::Assign {
                    target: Expr::name("b"),
                    value: Expr::BinOp {
                        op: crate::ast::BinOp::Mod,
                        left: Box::new(Expr::int(-7)),
                        right: Box::new(Expr::int(3)),
                    },
                    line: 2,
                },
                Stmt::Assign {
                    target: Expr::name("c"),
                    value: Expr::BinOp {
                        op: crate::ast::BinOp::Div,
                        left: Box::new(Expr::int(7)),
                        right: Box::new(Expr::int(2)),
                    },
                    line: 3,
                },
                Stmt::Assign {
                    target: Expr::name("d"),
                    value: Expr::BinOp {
                        op: crate::ast::BinOp::Pow,
                        left: Box::new(Expr::int(2)),
                        right: Box::new(Expr::int(10)),
                    },
                    line: 4,
                },
            ],
        };
        let ns = run_source(&m);
        assert_eq!(ns.get("a"), Some(&Value::Int(-4)));
        assert_eq!(ns.get("b"), Some(&Value::Int(2)));
        assert_eq!(ns.get("c"), Some(&Value::Float(3.5)));
        assert_eq!(ns.get("d"), Some(&Value::Int(1024)));
    }

    #[test]
    fn call_binds_arguments_and_defaults() {
        let def = FunctionDef {
            name: "add".into(),
            params: vec![
                Param { name: "a".into(), default: None },
                Param { name: "b".into(), default: Some(Expr::int(10)) },
            ],
            body: vec![Stmt::Return {
                value: Some(Expr::BinOp {
                    op: crate::ast::BinOp::Add,
                    left: Box::new(Expr::name("a")),
                    right: Box::new(Expr::name("b")),
                }),
                line: 2,
            }],
            line: 1,
        };
        let m = Module { body: vec![Stmt::FunctionDef(def)] };
        let mut ns = run_source(&m);
        let f = ns.get("add").cloned().unwrap();
        assert_eq!(call_function(&f, &[Value::Int(1)], &mut ns).unwrap(), Value::Int(11));
        assert_eq!(
            call_function(&f, &[Value::Int(1), Value::Int(2)], &mut ns).unwrap(),
            Value::Int(3)
        );
        match call_function(&f, &[], &mut ns) {
            Err(DeslateError::Exec { reason }) => assert!(reason.contains("add()")),
            other => panic!("expected an argument-count fault, got {:?}", other),
        }
    }

    #[test]
    fn raised_exception_reaches_the_matching_handler() {
        let def = FunctionDef {
            name: "guard".into(),
            params: vec![Param { name: "x".into(), default: None }],
            body: vec![Stmt::Try {
                body: vec![
                    Stmt::If {
                        test: Expr::Compare {
                            op: crate::ast::CmpOp::Lt,
                            left: Box::new(Expr::name("x")),
                            right: Box::new(Expr::int(0)),
                        },
                        body: vec![Stmt::Raise {
                            exc: Some(Expr::call(
                                Expr::name("ValueError"),
                                vec![Expr::string("negative")],
                            )),
                            line: 4,
                        }],
                        orelse: Vec::new(),
                        line: 3,
                    },
                    Stmt::Return { value: Some(Expr::name("x")), line: 5 },
                ],
                handlers: vec![crate::ast::ExceptHandler {
                    typ: Some(Expr::name("ValueError")),
                    name: Some("e".into()),
                    body: vec![Stmt::Return {
                        value: Some(Expr::Attribute {
                            value: Box::new(Expr::name("e")),
                            attr: "message".into(),
                        }),
                        line: 7,
                    }],
                    line: 6,
                }],
                finalbody: Vec::new(),
                line: 2,
            }],
            line: 1,
        };
        let m = Module { body: vec![Stmt::FunctionDef(def)] };
        let mut ns = run_source(&m);
        let f = ns.get("guard").cloned().unwrap();
        assert_eq!(call_function(&f, &[Value::Int(5)], &mut ns).unwrap(), Value::Int(5));
        assert_eq!(
            call_function(&f, &[Value::Int(-1)], &mut ns).unwrap(),
            Value::str("negative")
        );
    }

    #[test]
    fn unmatched_exception_escapes_with_its_kind() {
        let def = FunctionDef {
            name: "boom".into(),
            params: vec![],
            body: vec![Stmt::Raise {
                exc: Some(Expr::call(Expr::name("KeyError"), vec![Expr::string("missing")])),
                line: 2,
            }],
            line: 1,
        };
        let m = Module { body: vec![Stmt::FunctionDef(def)] };
        let mut ns = run_source(&m);
        let f = ns.get("boom").cloned().unwrap();
        match call_function(&f, &[], &mut ns) {
            Err(DeslateError::Uncaught { kind, message }) => {
                assert_eq!(kind, "KeyError");
                assert_eq!(message, "missing");
            }
            other => panic!("expected Uncaught, got {:?}", other),
        }
    }

    #[test]
    fn finally_cleanup_runs_on_the_exception_path_too() {
        // Marker slot bumped by the finally block either way.
        let def = FunctionDef {
            name: "f".into(),
            params: vec![
                Param { name: "marks".into(), default: None },
                Param { name: "explode".into(), default: None },
            ],
            body: vec![
                Stmt::Try {
                    body: vec![Stmt::If {
                        test: Expr::name("explode"),
                        body: vec![Stmt::Raise {
                            exc: Some(Expr::call(Expr::name("ValueError"), vec![])),
                            line: 4,
                        }],
                        orelse: Vec::new(),
                        line: 3,
                    }],
                    handlers: Vec::new(),
                    finalbody: vec![Stmt::Assign {
                        target: Expr::Subscript {
                            value: Box::new(Expr::name("marks")),
                            index: Box::new(Expr::int(0)),
                        },
                        value: Expr::BinOp {
                            op: crate::ast::BinOp::Add,
                            left: Box::new(Expr::Subscript {
                                value: Box::new(Expr::name("marks")),
                                index: Box::new(Expr::int(0)),
                            }),
                            right: Box::new(Expr::int(1)),
                        },
                        line: 6,
                    }],
                    line: 2,
                },
                Stmt::Return { value: Some(Expr::Literal(Const::None)), line: 7 },
            ],
            line: 1,
        };
        let m = Module { body: vec![Stmt::FunctionDef(def)] };
        let mut ns = run_source(&m);
        let f = ns.get("f").cloned().unwrap();
        let marks = Value::list(vec![Value::Int(0)]);

        call_function(&f, &[marks.clone(), Value::Bool(false)], &mut ns).unwrap();
        assert_eq!(subscr_get(&marks, &Value::Int(0)).unwrap(), Value::Int(1));

        match call_function(&f, &[marks.clone(), Value::Bool(true)], &mut ns) {
            Err(DeslateError::Uncaught { kind, .. }) => assert_eq!(kind, "ValueError"),
            other => panic!("expected the exception to escape, got {:?}", other),
        }
        assert_eq!(subscr_get(&marks, &Value::Int(0)).unwrap(), Value::Int(2));
    }

    #[test]
    fn unbounded_recursion_trips_the_depth_limit() {
        let def = FunctionDef {
            name: "spin".into(),
            params: vec![Param { name: "n".into(), default: None }],
            body: vec![Stmt::Return {
                value: Some(Expr::call(Expr::name("spin"), vec![Expr::name("n")])),
                line: 2,
            }],
            line: 1,
        };
        let m = Module { body: vec![Stmt::FunctionDef(def)] };
        let mut ns = run_source(&m);
        let f = ns.get("spin").cloned().unwrap();
        match call_function(&f, &[Value::Int(0)], &mut ns) {
            Err(DeslateError::Exec { reason }) => assert!(reason.contains("recursion")),
            other => panic!("expected a recursion fault, got {:?}", other),
        }
    }

    #[test]
    fn builtins_cover_len_range_and_extremes() {
        let m = Module {
            body: vec![
                Stmt::Assign {
                    target: Expr::name("n"),
                    value: Expr::call(
                        Expr::name("len"),
                        vec![Expr::call(Expr::name("range"), vec![Expr::int(2), Expr::int(9)])],
                    ),
                    line: 1,
                },
                Stmt::Assign {
                    target: Expr::name("lo"),
                    value: Expr::call(
                        Expr::name("min"),
                        vec![Expr::List(vec![Expr::int(4), Expr::int(1), Expr::int(7)])],
                    ),
                    line: 2,
                },
                Stmt::Assign {
                    target: Expr::name("hi"),
                    value: Expr::call(Expr::name("max"), vec![Expr::int(4), Expr::int(9)]),
                    line: 3,
                },
            ],
        };
        let ns = run_source(&m);
        assert_eq!(ns.get("n"), Some(&Value::Int(7)));
        assert_eq!(ns.get("lo"), Some(&Value::Int(1)));
        assert_eq!(ns.get("hi"), Some(&Value::Int(9)));
    }

    #[test]
    fn native_raised_exceptions_are_catchable() {
        let def = FunctionDef {
            name: "lowest".into(),
            params: vec![Param { name: "xs".into(), default: None }],
            body: vec![Stmt::Try {
                body: vec![Stmt::Return {
                    value: Some(Expr::call(Expr::name("min"), vec![Expr::name("xs")])),
                    line: 3,
                }],
                handlers: vec![crate::ast::ExceptHandler {
                    typ: Some(Expr::name("ValueError")),
                    name: None,
                    body: vec![Stmt::Return { value: Some(Expr::int(-1)), line: 5 }],
                    line: 4,
                }],
                finalbody: Vec::new(),
                line: 2,
            }],
            line: 1,
        };
        let m = Module { body: vec![Stmt::FunctionDef(def)] };
        let mut ns = run_source(&m);
        let f = ns.get("lowest").cloned().unwrap();
        assert_eq!(
            call_function(&f, &[Value::list(vec![Value::Int(3), Value::Int(2)])], &mut ns)
                .unwrap(),
            Value::Int(2)
        );
        assert_eq!(call_function(&f, &[Value::list(vec![])], &mut ns).unwrap(), Value::Int(-1));
    }

    #[test]
    fn comprehension_builds_the_filtered_list() {
        let m = Module {
            body: vec![Stmt::Assign {
                target: Expr::name("xs"),
                value: Expr::ListComp {
                    elt: Box::new(Expr::BinOp {
                        op: crate::ast::BinOp::Mul,
                        left: Box::new(Expr::name("i")),
                        right: Box::new(Expr::name("i")),
                    }),
                    target: "i".into(),
                    iter: Box::new(Expr::call(Expr::name("range"), vec![Expr::int(4)])),
                    ifs: vec![Expr::Compare {
                        op: crate::ast::CmpOp::Ne,
                        left: Box::new(Expr::name("i")),
                        right: Box::new(Expr::int(2)),
                    }],
                },
                line: 1,
            }],
        };
        let ns = run_source(&m);
        assert_eq!(
            ns.get("xs"),
            Some(&Value::list(vec![Value::Int(0), Value::Int(1), Value::Int(9)]))
        );
    }

    #[test]
    fn division_by_zero_is_catchable() {
        let def = FunctionDef {
            name: "safe_div".into(),
            params: vec![
                Param { name: "a".into(), default: None },
                Param { name: "b".into(), default: None },
            ],
            body: vec![Stmt::Try {
                body: vec![Stmt::Return {
                    value: Some(Expr::BinOp {
                        op: crate::ast::BinOp::Div,
                        left: Box::new(Expr::name("a")),
                        right: Box::new(Expr::name("b")),
                    }),
                    line: 3,
                }],
                handlers: vec![crate::ast::ExceptHandler {
                    typ: Some(Expr::name("ZeroDivisionError")),
                    name: None,
                    body: vec![Stmt::Return { value: Some(Expr::int(-1)), line: 5 }],
                    line: 4,
                }],
                finalbody: Vec::new(),
                line: 2,
            }],
            line: 1,
        };
        let m = Module { body: vec![Stmt::FunctionDef(def)] };
        let mut ns = run_source(&m);
        let f = ns.get("safe_div").cloned().unwrap();
        assert_eq!(
            call_function(&f, &[Value::Int(8), Value::Int(2)], &mut ns).unwrap(),
            Value::Float(4.0)
        );
        assert_eq!(
            call_function(&f, &[Value::Int(8), Value::Int(0)], &mut ns).unwrap(),
            Value::Int(-1)
        );
    }

    #[test]
    fn loops_run_breaks_and_continues() {
        // Sum of odd numbers below 10, stopping early at 7.
        let def = FunctionDef {
            name: "f".into(),
            params: vec![],
            body: vec![
                Stmt::Assign { target: Expr::name("total"), value: Expr::int(0), line: 2 },
                Stmt::Assign { target: Expr::name("i"), value: Expr::int(0), line: 3 },
                Stmt::While {
                    test: Expr::Compare {
                        op: crate::ast::CmpOp::Lt,
                        left: Box::new(Expr::name("i")),
                        right: Box::new(Expr::int(10)),
                    },
                    body: vec![
                        Stmt::Assign {
                            target: Expr::name("i"),
                            value: Expr::BinOp {
                                op: crate::ast::BinOp::Add,
                                left: Box::new(Expr::name("i")),
                                right: Box::new(Expr::int(1)),
                            },
                            line: 5,
                        },
                        Stmt::If {
                            test: Expr::Compare {
                                op: crate::ast::CmpOp::Eq,
                                left: Box::new(Expr::BinOp {
                                    op: crate::ast::BinOp::Mod,
                                    left: Box::new(Expr::name("i")),
                                    right: Box::new(Expr::int(2)),
                                }),
                                right: Box::new(Expr::int(0)),
                            },
                            body: vec![Stmt::Continue { line: 7 }],
                            orelse: Vec::new(),
                            line: 6,
                        },
                        Stmt::If {
                            test: Expr::Compare {
                                op: crate::ast::CmpOp::Gt,
                                left: Box::new(Expr::name("i")),
                                right: Box::new(Expr::int(7)),
                            },
                            body: vec![Stmt::Break { line: 9 }],
                            orelse: Vec::new(),
                            line: 8,
                        },
                        Stmt::Assign {
                            target: Expr::name("total"),
                            value: Expr::BinOp {
                                op: crate::ast::BinOp::Add,
                                left: Box::new(Expr::name("total")),
                                right: Box::new(Expr::name("i")),
                            },
                            line: 10,
                        },
                    ],
                    line: 4,
                },
                Stmt::Return { value: Some(Expr::name("total")), line: 11 },
            ],
            line: 1,
        };
        let mut ns = Namespace::with_builtins();
        let f = compile_def(&def);
        // 1 + 3 + 5 + 7 = 16
        assert_eq!(call_function(&f, &[], &mut ns).unwrap(), Value::Int(16));
    }

    #[test]
    fn defined_functions_carry_their_unit() {
        // make_function leaves the nested unit inspectable on the value, so
        // the decompiler can pick it back up later.
        let def = FunctionDef {
            name: "twice".into(),
            params: vec![Param { name: "x".into(), default: None }],
            body: vec![Stmt::Return {
                value: Some(Expr::BinOp {
                    op: crate::ast::BinOp::Mul,
                    left: Box::new(Expr::name("x")),
                    right: Box::new(Expr::int(2)),
                }),
                line: 2,
            }],
            line: 1,
        };
        let m = Module { body: vec![Stmt::FunctionDef(def)] };
        let ns = run_source(&m);
        match ns.get("twice") {
            Some(Value::Function(f)) => {
                assert_eq!(f.unit.name, "twice");
                assert_eq!(f.unit.param_count, 1);
                assert!(f.defaults.is_empty());
            }
            other => panic!("expected a function value, got {:?}", other),
        }
    }

    #[test]
    fn bulk_updates_can_be_vetoed() {
        let mut ns = Namespace::with_builtins();
        ns.on_change(|change| {
            if change.origin == "forbidden" {
                change.veto();
            }
        });

        let mut blocked = NamespaceChange::new("forbidden");
        blocked.added.push(("x".to_string(), Value::Int(1)));
        assert!(!ns.apply_update(blocked));
        assert!(!ns.contains("x"));

        let mut allowed = NamespaceChange::new("editor");
        allowed.added.push(("x".to_string(), Value::Int(1)));
        assert!(ns.apply_update(allowed));
        assert_eq!(ns.get("x"), Some(&Value::Int(1)));
    }
}
