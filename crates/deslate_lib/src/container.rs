use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::DeslateError;
use crate::unit::{CodeUnit, Const, ExceptionEntry, LineEntry};

/// Container magic: "SL" little-endian, followed by b"\r\n" so that text-mode
/// transfer damage is caught up front.
pub const CONTAINER_MAGIC: u16 = 0x4C53;

const HEADER_LEN: usize = 12;

const CONST_NONE: u8 = 0;
const CONST_BOOL: u8 = 1;
const CONST_INT: u8 = 2;
const CONST_FLOAT: u8 = 3;
const CONST_STR: u8 = 4;
const CONST_TUPLE: u8 = 5;

#[derive(Debug, Clone)]
pub struct Container {
    pub timestamp: u32,
    pub unit: CodeUnit,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn get_u8(&mut self) -> Result<u8, DeslateError> {
        if self.remaining() < 1 {
            return Err(DeslateError::Eof);
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn get_u16(&mut self) -> Result<u16, DeslateError> {
        if self.remaining() < 2 {
            return Err(DeslateError::Eof);
        }
        let v = LittleEndian::read_u16(&self.buf[self.pos..self.pos + 2]);
        self.pos += 2;
        Ok(v)
    }

    fn get_u32(&mut self) -> Result<u32, DeslateError> {
        if self.remaining() < 4 {
            return Err(DeslateError::Eof);
        }
        let v = LittleEndian::read_u32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    fn get_i64(&mut self) -> Result<i64, DeslateError> {
        if self.remaining() < 8 {
            return Err(DeslateError::Eof);
        }
        let v = LittleEndian::read_i64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    fn get_f64(&mut self) -> Result<f64, DeslateError> {
        if self.remaining() < 8 {
            return Err(DeslateError::Eof);
        }
        let v = LittleEndian::read_f64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], DeslateError> {
        if self.remaining() < n {
            return Err(DeslateError::Eof);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn get_str(&mut self) -> Result<String, DeslateError> {
        let n = self.get_u32()? as usize;
        let bytes = self.get_bytes(n)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DeslateError::malformed("string payload is not valid utf-8"))
    }
}

fn read_const(r: &mut Reader<'_>) -> Result<Const, DeslateError> {
    match r.get_u8()? {
        CONST_NONE => Ok(Const::None),
        CONST_BOOL => Ok(Const::Bool(r.get_u8()? != 0)),
        CONST_INT => Ok(Const::Int(r.get_i64()?)),
        CONST_FLOAT => Ok(Const::Float(r.get_f64()?)),
        CONST_STR => Ok(Const::Str(r.get_str()?)),
        CONST_TUPLE => {
            let n = r.get_u32()? as usize;
            let mut items = Vec::with_capacity(n.min(1024));
            for _ in 0..n {
                items.push(read_const(r)?);
            }
            Ok(Const::Tuple(items))
        }
        tag => Err(DeslateError::malformed(format!("unknown constant tag {tag}"))),
    }
}

fn read_unit(r: &mut Reader<'_>) -> Result<CodeUnit, DeslateError> {
    let name = r.get_str()?;
    let origin = r.get_str()?;
    let first_line = r.get_u32()?;
    let flags = r.get_u32()?;
    let param_count = r.get_u16()?;

    let code_len = r.get_u32()? as usize;
    let code = r.get_bytes(code_len)?.to_vec();

    let n_consts = r.get_u32()? as usize;
    let mut consts = Vec::with_capacity(n_consts.min(1024));
    for _ in 0..n_consts {
        consts.push(read_const(r)?);
    }

    let n_names = r.get_u32()? as usize;
    let mut names = Vec::with_capacity(n_names.min(1024));
    for _ in 0..n_names {
        names.push(r.get_str()?);
    }

    let n_vars = r.get_u32()? as usize;
    let mut varnames = Vec::with_capacity(n_vars.min(1024));
    for _ in 0..n_vars {
        varnames.push(r.get_str()?);
    }

    let n_nested = r.get_u32()? as usize;
    let mut nested = Vec::with_capacity(n_nested.min(64));
    for _ in 0..n_nested {
        nested.push(read_unit(r)?);
    }

    let n_exc = r.get_u32()? as usize;
    let mut exc_table = Vec::with_capacity(n_exc.min(256));
    for _ in 0..n_exc {
        let start = r.get_u32()?;
        let end = r.get_u32()?;
        let handler = r.get_u32()?;
        exc_table.push(ExceptionEntry { start, end, handler });
    }

    let n_lines = r.get_u32()? as usize;
    let mut lines = Vec::with_capacity(n_lines.min(1024));
    for _ in 0..n_lines {
        let offset = r.get_u32()?;
        let line = r.get_u32()?;
        lines.push(LineEntry { offset, line });
    }

    Ok(CodeUnit {
        name,
        origin,
        first_line,
        flags,
        param_count,
        code,
        consts,
        names,
        varnames,
        nested,
        exc_table,
        lines,
    })
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    let mut b = [0u8; 2];
    LittleEndian::write_u16(&mut b, v);
    out.extend_from_slice(&b);
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, v);
    out.extend_from_slice(&b);
}

fn push_i64(out: &mut Vec<u8>, v: i64) {
    let mut b = [0u8; 8];
    LittleEndian::write_i64(&mut b, v);
    out.extend_from_slice(&b);
}

fn push_f64(out: &mut Vec<u8>, v: f64) {
    let mut b = [0u8; 8];
    LittleEndian::write_f64(&mut b, v);
    out.extend_from_slice(&b);
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    push_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn write_const(out: &mut Vec<u8>, c: &Const) {
    match c {
        Const::None => out.push(CONST_NONE),
        Const::Bool(b) => {
            out.push(CONST_BOOL);
            out.push(*b as u8);
        }
        Const::Int(v) => {
            out.push(CONST_INT);
            push_i64(out, *v);
        }
        Const::Float(v) => {
            out.push(CONST_FLOAT);
            push_f64(out, *v);
        }
        Const::Str(s) => {
            out.push(CONST_STR);
            write_str(out, s);
        }
        Const::Tuple(items) => {
            out.push(CONST_TUPLE);
            push_u32(out, items.len() as u32);
            for it in items {
                write_const(out, it);
            }
        }
    }
}

fn write_unit(out: &mut Vec<u8>, unit: &CodeUnit) {
    write_str(out, &unit.name);
    write_str(out, &unit.origin);
    push_u32(out, unit.first_line);
    push_u32(out, unit.flags);
    push_u16(out, unit.param_count);

    push_u32(out, unit.code.len() as u32);
    out.extend_from_slice(&unit.code);

    push_u32(out, unit.consts.len() as u32);
    for c in &unit.consts {
        write_const(out, c);
    }

    push_u32(out, unit.names.len() as u32);
    for n in &unit.names {
        write_str(out, n);
    }

    push_u32(out, unit.varnames.len() as u32);
    for n in &unit.varnames {
        write_str(out, n);
    }

    push_u32(out, unit.nested.len() as u32);
    for n in &unit.nested {
        write_unit(out, n);
    }

    push_u32(out, unit.exc_table.len() as u32);
    for e in &unit.exc_table {
        push_u32(out, e.start);
        push_u32(out, e.end);
        push_u32(out, e.handler);
    }

    push_u32(out, unit.lines.len() as u32);
    for l in &unit.lines {
        push_u32(out, l.offset);
        push_u32(out, l.line);
    }
}

/// Parses one container from a fully buffered byte slice. Strict: header
/// damage, length disagreement, and undecodable payload are all hard
/// failures, never partial results.
pub fn load_container(bytes: &[u8]) -> Result<Container, DeslateError> {
    if bytes.len() < HEADER_LEN {
        return Err(DeslateError::malformed(format!(
            "header needs {HEADER_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let magic = LittleEndian::read_u16(&bytes[0..2]);
    if magic != CONTAINER_MAGIC {
        return Err(DeslateError::malformed(format!("bad magic 0x{magic:04x}")));
    }
    if &bytes[2..4] != b"\r\n" {
        return Err(DeslateError::malformed("header terminator damaged"));
    }
    let timestamp = LittleEndian::read_u32(&bytes[4..8]);
    let payload_len = LittleEndian::read_u32(&bytes[8..12]) as usize;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(DeslateError::malformed(format!(
            "declared payload length {payload_len}, found {}",
            payload.len()
        )));
    }

    let mut r = Reader::new(payload);
    let unit = read_unit(&mut r).map_err(|e| match e {
        DeslateError::Eof => DeslateError::malformed("truncated payload"),
        other => other,
    })?;
    if r.remaining() != 0 {
        return Err(DeslateError::malformed(format!(
            "{} trailing bytes after payload",
            r.remaining()
        )));
    }
    Ok(Container { timestamp, unit })
}

/// Buffers the whole stream, then parses; the format is small enough that
/// partial-read recovery is not worth having.
pub fn read_container<R: Read>(mut input: R) -> Result<Container, DeslateError> {
    let mut bytes = Vec::new();
    input.read_to_end(&mut bytes)?;
    load_container(&bytes)
}

pub fn container_bytes(unit: &CodeUnit, timestamp: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    write_unit(&mut payload, unit);

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    push_u16(&mut out, CONTAINER_MAGIC);
    out.extend_from_slice(b"\r\n");
    push_u32(&mut out, timestamp);
    push_u32(&mut out, payload.len() as u32);
    out.extend_from_slice(&payload);
    out
}

pub fn write_container<W: Write>(
    unit: &CodeUnit,
    timestamp: u32,
    mut output: W,
) -> Result<(), DeslateError> {
    output.write_all(&container_bytes(unit, timestamp))?;
    Ok(())
}
