// The built-in operations of the virtual machine.
//
// Primitives live in the virtual address range [PB, PT) and are
// invoked through CALL like ordinary functions: arguments are
// consumed from the stack, native code runs, the result is pushed.
// The set is closed and identified by displacement (address - PB);
// new primitives must append, never renumber.
//
// Console I/O goes through the Console trait so embedders and tests
// can substitute the VM's stdin/stdout. Matrix file I/O talks to the
// file system directly; rows are comma-separated, blank lines are
// dropped, and the exact row and column count of the variant is
// enforced.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, BufRead, Write};

use regex::Regex;

use crate::error::{Error, ErrorKind, Result};
use crate::image::Image;
use crate::machine::Machine;
use crate::value::{TypeTag, Value};

pub const PRIMITIVE_COUNT: i32 = 60;


// Displacements 0..60, in declaration order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Primitive {
    Nop,
    Err,
    Not,
    And,
    Or,
    Succ,
    Pred,
    NegI,
    AddI,
    SubI,
    MulI,
    DivI,
    ModI,
    EqI,
    NeI,
    LtI,
    LeI,
    GtI,
    GeI,
    NegF,
    AddF,
    SubF,
    MulF,
    DivF,
    ModF,
    EqF,
    NeF,
    LtF,
    LeF,
    GtF,
    GeF,
    PowInt,
    PowFloat,
    SqrtInt,
    SqrtFloat,
    PrintInt,
    PrintFloat,
    PrintBool,
    PrintString,
    PrintLine,
    ReadInt,
    ReadFloat,
    ReadBool,
    Int2Float,
    Float2Int,
    ReadMatrixInt9,
    ReadMatrixInt16,
    ReadMatrixInt64,
    ReadMatrixFloat9,
    ReadMatrixFloat16,
    ReadMatrixFloat64,
    WriteMatrixInt9,
    WriteMatrixInt16,
    WriteMatrixInt64,
    WriteMatrixFloat9,
    WriteMatrixFloat16,
    WriteMatrixFloat64,
    MatMulI,
    MatMulF,
    MatTranspose,
}

const PRIMITIVES: [Primitive; PRIMITIVE_COUNT as usize] = [
    Primitive::Nop,
    Primitive::Err,
    Primitive::Not,
    Primitive::And,
    Primitive::Or,
    Primitive::Succ,
    Primitive::Pred,
    Primitive::NegI,
    Primitive::AddI,
    Primitive::SubI,
    Primitive::MulI,
    Primitive::DivI,
    Primitive::ModI,
    Primitive::EqI,
    Primitive::NeI,
    Primitive::LtI,
    Primitive::LeI,
    Primitive::GtI,
    Primitive::GeI,
    Primitive::NegF,
    Primitive::AddF,
    Primitive::SubF,
    Primitive::MulF,
    Primitive::DivF,
    Primitive::ModF,
    Primitive::EqF,
    Primitive::NeF,
    Primitive::LtF,
    Primitive::LeF,
    Primitive::GtF,
    Primitive::GeF,
    Primitive::PowInt,
    Primitive::PowFloat,
    Primitive::SqrtInt,
    Primitive::SqrtFloat,
    Primitive::PrintInt,
    Primitive::PrintFloat,
    Primitive::PrintBool,
    Primitive::PrintString,
    Primitive::PrintLine,
    Primitive::ReadInt,
    Primitive::ReadFloat,
    Primitive::ReadBool,
    Primitive::Int2Float,
    Primitive::Float2Int,
    Primitive::ReadMatrixInt9,
    Primitive::ReadMatrixInt16,
    Primitive::ReadMatrixInt64,
    Primitive::ReadMatrixFloat9,
    Primitive::ReadMatrixFloat16,
    Primitive::ReadMatrixFloat64,
    Primitive::WriteMatrixInt9,
    Primitive::WriteMatrixInt16,
    Primitive::WriteMatrixInt64,
    Primitive::WriteMatrixFloat9,
    Primitive::WriteMatrixFloat16,
    Primitive::WriteMatrixFloat64,
    Primitive::MatMulI,
    Primitive::MatMulF,
    Primitive::MatTranspose,
];

impl Primitive {
    pub fn displacement(self) -> i32 {
        self as i32
    }

    pub fn from_displacement(d: i32) -> Result<Primitive> {
        if d >= 0 && d < PRIMITIVE_COUNT {
            Ok(PRIMITIVES[d as usize])
        } else {
            Err(Error::new(
                ErrorKind::InvalidAddress,
                format!("no primitive at displacement {}", d),
            ))
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Primitive::Nop => "nop",
            Primitive::Err => "err",
            Primitive::Not => "not",
            Primitive::And => "and",
            Primitive::Or => "or",
            Primitive::Succ => "succ",
            Primitive::Pred => "pred",
            Primitive::NegI => "negI",
            Primitive::AddI => "addI",
            Primitive::SubI => "subI",
            Primitive::MulI => "mulI",
            Primitive::DivI => "divI",
            Primitive::ModI => "modI",
            Primitive::EqI => "eqI",
            Primitive::NeI => "neI",
            Primitive::LtI => "ltI",
            Primitive::LeI => "leI",
            Primitive::GtI => "gtI",
            Primitive::GeI => "geI",
            Primitive::NegF => "negF",
            Primitive::AddF => "addF",
            Primitive::SubF => "subF",
            Primitive::MulF => "mulF",
            Primitive::DivF => "divF",
            Primitive::ModF => "modF",
            Primitive::EqF => "eqF",
            Primitive::NeF => "neF",
            Primitive::LtF => "ltF",
            Primitive::LeF => "leF",
            Primitive::GtF => "gtF",
            Primitive::GeF => "geF",
            Primitive::PowInt => "powInt",
            Primitive::PowFloat => "powFloat",
            Primitive::SqrtInt => "sqrtInt",
            Primitive::SqrtFloat => "sqrtFloat",
            Primitive::PrintInt => "printInt",
            Primitive::PrintFloat => "printFloat",
            Primitive::PrintBool => "printBool",
            Primitive::PrintString => "printString",
            Primitive::PrintLine => "printLine",
            Primitive::ReadInt => "readInt",
            Primitive::ReadFloat => "readFloat",
            Primitive::ReadBool => "readBool",
            Primitive::Int2Float => "int2float",
            Primitive::Float2Int => "float2int",
            Primitive::ReadMatrixInt9 => "readMatrixInt9",
            Primitive::ReadMatrixInt16 => "readMatrixInt16",
            Primitive::ReadMatrixInt64 => "readMatrixInt64",
            Primitive::ReadMatrixFloat9 => "readMatrixFloat9",
            Primitive::ReadMatrixFloat16 => "readMatrixFloat16",
            Primitive::ReadMatrixFloat64 => "readMatrixFloat64",
            Primitive::WriteMatrixInt9 => "writeMatrixInt9",
            Primitive::WriteMatrixInt16 => "writeMatrixInt16",
            Primitive::WriteMatrixInt64 => "writeMatrixInt64",
            Primitive::WriteMatrixFloat9 => "writeMatrixFloat9",
            Primitive::WriteMatrixFloat16 => "writeMatrixFloat16",
            Primitive::WriteMatrixFloat64 => "writeMatrixFloat64",
            Primitive::MatMulI => "matMulI",
            Primitive::MatMulF => "matMulF",
            Primitive::MatTranspose => "matTranspose",
        }
    }
}


// The VM's console seam. Blocking reads happen here and nowhere else.
pub trait Console {
    fn write(&mut self, text: &str) -> Result<()>;
    fn read_line(&mut self) -> Result<String>;
}

pub struct StdConsole;

impl Console for StdConsole {
    fn write(&mut self, text: &str) -> Result<()> {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle.write_all(text.as_bytes())?;
        handle.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = io::stdin().lock().read_line(&mut line)?;
        if n == 0 {
            return Err(Error::io("end of input"));
        }
        Ok(line)
    }
}

// Scripted console for tests and embedders that capture output.
pub struct MemoryConsole {
    input: VecDeque<String>,
    output: String,
}

impl MemoryConsole {
    pub fn new() -> MemoryConsole {
        MemoryConsole {
            input: VecDeque::new(),
            output: String::new(),
        }
    }

    pub fn with_input(lines: &[&str]) -> MemoryConsole {
        MemoryConsole {
            input: lines.iter().map(|l| String::from(*l)).collect(),
            output: String::new(),
        }
    }

    pub fn output(&self) -> &str {
        &self.output
    }
}

impl Console for MemoryConsole {
    fn write(&mut self, text: &str) -> Result<()> {
        self.output.push_str(text);
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        self.input
            .pop_front()
            .ok_or_else(|| Error::io("end of input"))
    }
}


// Factors out the boiler plate of the numeric operator families.
macro_rules! int_binop {
    ($m:expr, $op:tt) => {{
        let b = $m.pop()?.as_int()?;
        let a = $m.pop()?.as_int()?;
        $m.push(Value::Int(a $op b))
    }};
}

macro_rules! int_cmp {
    ($m:expr, $op:tt) => {{
        let b = $m.pop()?.as_int()?;
        let a = $m.pop()?.as_int()?;
        $m.push(Value::Bool(a $op b))
    }};
}

macro_rules! flt_binop {
    ($m:expr, $op:tt) => {{
        let b = $m.pop()?.as_float()?;
        let a = $m.pop()?.as_float()?;
        $m.push(Value::Float(a $op b))
    }};
}

macro_rules! flt_cmp {
    ($m:expr, $op:tt) => {{
        let b = $m.pop()?.as_float()?;
        let a = $m.pop()?.as_float()?;
        $m.push(Value::Bool(a $op b))
    }};
}


// Execute the primitive at the given displacement against the machine.
pub fn invoke(
    displacement: i32,
    m: &mut Machine,
    image: &Image,
    console: &mut dyn Console,
) -> Result<()> {
    let primitive = Primitive::from_displacement(displacement)?;
    trace!("primitive {}", primitive.name());
    match primitive {
        Primitive::Nop => Ok(()),

        Primitive::Err => {
            let id = m.pop()?.as_int()?;
            let message = image.get_string(id)?.to_string();
            Err(Error::new(ErrorKind::RuntimeError, message))
        }

        Primitive::Not => {
            let a = m.pop()?.as_bool()?;
            m.push(Value::Bool(!a))
        }
        Primitive::And => {
            let b = m.pop()?.as_bool()?;
            let a = m.pop()?.as_bool()?;
            m.push(Value::Bool(a & b))
        }
        Primitive::Or => {
            let b = m.pop()?.as_bool()?;
            let a = m.pop()?.as_bool()?;
            m.push(Value::Bool(a | b))
        }

        // Successor and predecessor keep the operand's tag, so they
        // step addresses as happily as integers.
        Primitive::Succ => {
            let a = m.pop()?;
            m.push(Value::from_bits(a.tag(), a.bits() + 1))
        }
        Primitive::Pred => {
            let a = m.pop()?;
            m.push(Value::from_bits(a.tag(), a.bits() - 1))
        }

        Primitive::NegI => {
            let a = m.pop()?.as_int()?;
            m.push(Value::Int(-a))
        }
        // addI propagates an address tag from either operand: adding
        // an int to an address yields an address of the same kind.
        // The code generator leans on this for LOADA + offset.
        Primitive::AddI => {
            let b = m.pop()?;
            let a = m.pop()?;
            let sum = a.as_int()? + b.as_int()?;
            let tag = match (a.tag(), b.tag()) {
                (TypeTag::CodeAddr, _) | (_, TypeTag::CodeAddr) => TypeTag::CodeAddr,
                (TypeTag::StackAddr, _) | (_, TypeTag::StackAddr) => TypeTag::StackAddr,
                _ => TypeTag::Int,
            };
            m.push(Value::from_bits(tag, sum))
        }
        Primitive::SubI => int_binop!(m, -),
        Primitive::MulI => int_binop!(m, *),
        Primitive::DivI => {
            let b = m.pop()?.as_int()?;
            let a = m.pop()?.as_int()?;
            if b == 0 {
                return Err(Error::new(ErrorKind::ZeroDivision, "division by zero"));
            }
            m.push(Value::Int(a / b))
        }
        Primitive::ModI => {
            let b = m.pop()?.as_int()?;
            let a = m.pop()?.as_int()?;
            if b == 0 {
                return Err(Error::new(ErrorKind::ZeroDivision, "modulo by zero"));
            }
            m.push(Value::Int(a % b))
        }

        Primitive::EqI => int_cmp!(m, ==),
        Primitive::NeI => int_cmp!(m, !=),
        Primitive::LtI => int_cmp!(m, <),
        Primitive::LeI => int_cmp!(m, <=),
        Primitive::GtI => int_cmp!(m, >),
        Primitive::GeI => int_cmp!(m, >=),

        Primitive::NegF => {
            let a = m.pop()?.as_float()?;
            m.push(Value::Float(-a))
        }
        Primitive::AddF => flt_binop!(m, +),
        Primitive::SubF => flt_binop!(m, -),
        Primitive::MulF => flt_binop!(m, *),
        Primitive::DivF => {
            let b = m.pop()?.as_float()?;
            let a = m.pop()?.as_float()?;
            if b == 0.0 {
                return Err(Error::new(ErrorKind::ZeroDivision, "division by zero"));
            }
            m.push(Value::Float(a / b))
        }
        Primitive::ModF => flt_binop!(m, %),

        Primitive::EqF => flt_cmp!(m, ==),
        Primitive::NeF => flt_cmp!(m, !=),
        Primitive::LtF => flt_cmp!(m, <),
        Primitive::LeF => flt_cmp!(m, <=),
        Primitive::GtF => flt_cmp!(m, >),
        Primitive::GeF => flt_cmp!(m, >=),

        Primitive::PowInt => {
            let e = m.pop()?.as_int()?;
            let b = m.pop()?.as_int()?;
            let result = if e < 0 { 0 } else { b.wrapping_pow(e as u32) };
            m.push(Value::Int(result))
        }
        Primitive::PowFloat => {
            let e = m.pop()?.as_float()?;
            let b = m.pop()?.as_float()?;
            m.push(Value::Float(b.powf(e)))
        }
        Primitive::SqrtInt => {
            let a = m.pop()?.as_int()?;
            m.push(Value::Int((a as f64).sqrt() as i32))
        }
        Primitive::SqrtFloat => {
            let a = m.pop()?.as_float()?;
            m.push(Value::Float(a.sqrt()))
        }

        Primitive::PrintInt => {
            let a = m.pop()?.as_int()?;
            console.write(&a.to_string())
        }
        Primitive::PrintFloat => {
            let a = m.pop()?.as_float()?;
            console.write(&format!("{:?}", a))
        }
        Primitive::PrintBool => {
            let a = m.pop()?.as_bool()?;
            console.write(if a { "true" } else { "false" })
        }
        Primitive::PrintString => {
            let id = m.pop()?.as_int()?;
            let text = image.get_string(id)?.to_string();
            console.write(&text)
        }
        Primitive::PrintLine => console.write("\n"),

        Primitive::ReadInt => {
            let line = console.read_line()?;
            let v: i32 = line
                .trim()
                .parse()
                .map_err(|_| Error::io(format!("not an int: {:?}", line.trim())))?;
            m.push(Value::Int(v))
        }
        Primitive::ReadFloat => {
            let line = console.read_line()?;
            let v: f32 = line
                .trim()
                .parse()
                .map_err(|_| Error::io(format!("not a float: {:?}", line.trim())))?;
            m.push(Value::Float(v))
        }
        Primitive::ReadBool => {
            let line = console.read_line()?;
            let v: bool = line
                .trim()
                .parse()
                .map_err(|_| Error::io(format!("not a bool: {:?}", line.trim())))?;
            m.push(Value::Bool(v))
        }

        Primitive::Int2Float => {
            let a = m.pop()?.as_int()?;
            m.push(Value::Float(a as f32))
        }
        Primitive::Float2Int => {
            let a = m.pop()?.as_float()?;
            m.push(Value::Int(a as i32))
        }

        Primitive::ReadMatrixInt9 => read_matrix(m, image, 9, TypeTag::Int),
        Primitive::ReadMatrixInt16 => read_matrix(m, image, 16, TypeTag::Int),
        Primitive::ReadMatrixInt64 => read_matrix(m, image, 64, TypeTag::Int),
        Primitive::ReadMatrixFloat9 => read_matrix(m, image, 9, TypeTag::Float),
        Primitive::ReadMatrixFloat16 => read_matrix(m, image, 16, TypeTag::Float),
        Primitive::ReadMatrixFloat64 => read_matrix(m, image, 64, TypeTag::Float),

        Primitive::WriteMatrixInt9 => write_matrix_file(m, image, 9, TypeTag::Int),
        Primitive::WriteMatrixInt16 => write_matrix_file(m, image, 16, TypeTag::Int),
        Primitive::WriteMatrixInt64 => write_matrix_file(m, image, 64, TypeTag::Int),
        Primitive::WriteMatrixFloat9 => write_matrix_file(m, image, 9, TypeTag::Float),
        Primitive::WriteMatrixFloat16 => write_matrix_file(m, image, 16, TypeTag::Float),
        Primitive::WriteMatrixFloat64 => write_matrix_file(m, image, 64, TypeTag::Float),

        Primitive::MatMulI => mat_mul(m, TypeTag::Int),
        Primitive::MatMulF => mat_mul(m, TypeTag::Float),
        Primitive::MatTranspose => mat_transpose(m),
    }
}


lazy_static! {
    static ref SEPARATOR: Regex = Regex::new(r"\s*,\s*").unwrap();
}

// Parse the matrix file format: one row per line, comma-separated
// values, blank lines dropped, exact shape enforced.
fn parse_matrix(text: &str, rows: i32, cols: i32, tag: TypeTag) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity((rows * cols) as usize);
    let mut seen = 0;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        seen += 1;
        if seen > rows {
            return Err(Error::io(format!("expected {} rows, found more", rows)));
        }
        let fields: Vec<&str> = SEPARATOR.split(line).collect();
        if fields.len() as i32 != cols {
            return Err(Error::io(format!(
                "row {}: expected {} columns, found {}",
                seen,
                cols,
                fields.len()
            )));
        }
        for field in fields {
            let value = match tag {
                TypeTag::Int => Value::Int(
                    field
                        .parse()
                        .map_err(|_| Error::io(format!("not an int: {:?}", field)))?,
                ),
                TypeTag::Float => Value::Float(
                    field
                        .parse()
                        .map_err(|_| Error::io(format!("not a float: {:?}", field)))?,
                ),
                _ => return Err(Error::internal("matrix element type")),
            };
            out.push(value);
        }
    }
    if seen != rows {
        return Err(Error::io(format!("expected {} rows, found {}", rows, seen)));
    }
    Ok(out)
}

// Render a matrix row-wise with comma-space separators, the form the
// writeMatrix primitives put on disk. Floats always carry a dot.
pub fn format_matrix(rows: i32, cols: i32, values: &[Value], tag: TypeTag) -> Result<String> {
    let mut out = String::new();
    for r in 0..rows {
        for c in 0..cols {
            if c > 0 {
                out.push_str(", ");
            }
            let v = &values[(r * cols + c) as usize];
            match tag {
                TypeTag::Float => out.push_str(&format!("{:?}", v.as_float()?)),
                _ => out.push_str(&v.as_int()?.to_string()),
            }
        }
        out.push('\n');
    }
    Ok(out)
}

fn read_matrix(m: &mut Machine, image: &Image, dim: i32, tag: TypeTag) -> Result<()> {
    let id = m.pop()?.as_int()?;
    let path = image.get_string(id)?;
    let text =
        fs::read_to_string(path).map_err(|e| Error::io(format!("{}: {}", path, e)))?;
    let values = parse_matrix(&text, dim, dim, tag)?;
    for v in values {
        m.push(v)?;
    }
    Ok(())
}

fn write_matrix_file(m: &mut Machine, image: &Image, dim: i32, tag: TypeTag) -> Result<()> {
    let id = m.pop()?.as_int()?;
    let path = image.get_string(id)?.to_string();
    let base = m.dec_stack(dim * dim)?;
    let mut values = Vec::with_capacity((dim * dim) as usize);
    for i in 0..dim * dim {
        values.push(m.get_mem(base + i)?);
    }
    let text = format_matrix(dim, dim, &values, tag)?;
    fs::write(&path, text).map_err(|e| Error::io(format!("{}: {}", path, e)))?;
    Ok(())
}

// Stack layout, top rightmost: lmat, rmat, lrows, dim, rcols.
// Produces the lrows x rcols product in row-major order.
fn mat_mul(m: &mut Machine, tag: TypeTag) -> Result<()> {
    let rcols = m.pop()?.as_int()?;
    let dim = m.pop()?.as_int()?;
    let lrows = m.pop()?.as_int()?;
    if rcols < 0 || dim < 0 || lrows < 0 {
        return Err(Error::new(
            ErrorKind::RuntimeError,
            "negative matrix dimension",
        ));
    }
    let rbase = m.dec_stack(dim * rcols)?;
    let lbase = m.dec_stack(lrows * dim)?;

    match tag {
        TypeTag::Int => {
            let mut left = Vec::with_capacity((lrows * dim) as usize);
            for i in 0..lrows * dim {
                left.push(m.get_mem(lbase + i)?.as_int()?);
            }
            let mut right = Vec::with_capacity((dim * rcols) as usize);
            for i in 0..dim * rcols {
                right.push(m.get_mem(rbase + i)?.as_int()?);
            }
            for r in 0..lrows {
                for c in 0..rcols {
                    let mut sum = 0i32;
                    for k in 0..dim {
                        sum += left[(r * dim + k) as usize] * right[(k * rcols + c) as usize];
                    }
                    m.push(Value::Int(sum))?;
                }
            }
        }
        _ => {
            let mut left = Vec::with_capacity((lrows * dim) as usize);
            for i in 0..lrows * dim {
                left.push(m.get_mem(lbase + i)?.as_float()?);
            }
            let mut right = Vec::with_capacity((dim * rcols) as usize);
            for i in 0..dim * rcols {
                right.push(m.get_mem(rbase + i)?.as_float()?);
            }
            for r in 0..lrows {
                for c in 0..rcols {
                    let mut sum = 0f32;
                    for k in 0..dim {
                        sum += left[(r * dim + k) as usize] * right[(k * rcols + c) as usize];
                    }
                    m.push(Value::Float(sum))?;
                }
            }
        }
    }
    Ok(())
}

// Stack layout, top rightmost: mat, rows, cols.
fn mat_transpose(m: &mut Machine) -> Result<()> {
    let cols = m.pop()?.as_int()?;
    let rows = m.pop()?.as_int()?;
    if rows < 0 || cols < 0 {
        return Err(Error::new(
            ErrorKind::RuntimeError,
            "negative matrix dimension",
        ));
    }
    let base = m.dec_stack(rows * cols)?;
    let mut values = Vec::with_capacity((rows * cols) as usize);
    for i in 0..rows * cols {
        values.push(m.get_mem(base + i)?);
    }
    for c in 0..cols {
        for r in 0..rows {
            m.push(values[(r * cols + c) as usize])?;
        }
    }
    Ok(())
}
