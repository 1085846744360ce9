// The persistent form of a compiled program.
//
// An Image is a dense instruction vector (address = index) plus an
// interned string pool (id = index). Both are frozen once the
// assembler finalizes them; break points are the only thing a loaded
// image allows you to change.
//
// *Binary format*
//
// Big-endian 32-bit integers unless noted:
//
//   instruction count N
//   N x { opcode-id, register-id (0 when absent), n, d }
//   string count M
//   M x modified-UTF-8 string, 16-bit byte-length prefix
//
// Debug symbols live in a sidecar file with the same prefix:
//
//   carrier count K
//   K x { instruction-index, symbol-count,
//         symbol-count x { kind-id, payload } }
//
// Payload layout is fixed per kind: string for Name and Label, string
// plus flag for Comment, two ints for Location, one int for Type.
// BreakPoint symbols are never persisted.
//
// Strings use the JVM's modified UTF-8: NUL encoded as C0 80 and
// supplementary characters as CESU-8 surrogate pairs, so images are
// bit-compatible with DataOutputStream-based tooling.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, ErrorKind, Result, SourceLocation};
use crate::value::TypeTag;


// The fifteen TAM opcodes, numbered 0..15 in declaration order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    Load,
    Loada,
    Loadi,
    Loadl,
    Store,
    Storei,
    Call,
    Calli,
    Return,
    Push,
    Pop,
    Jump,
    Jumpi,
    Jumpif,
    Halt,
}

const OPCODES: [Opcode; 15] = [
    Opcode::Load,
    Opcode::Loada,
    Opcode::Loadi,
    Opcode::Loadl,
    Opcode::Store,
    Opcode::Storei,
    Opcode::Call,
    Opcode::Calli,
    Opcode::Return,
    Opcode::Push,
    Opcode::Pop,
    Opcode::Jump,
    Opcode::Jumpi,
    Opcode::Jumpif,
    Opcode::Halt,
];

impl Opcode {
    pub fn id(self) -> i32 {
        OPCODES.iter().position(|op| *op == self).unwrap() as i32
    }

    pub fn from_id(id: i32) -> Result<Opcode> {
        if id >= 0 && (id as usize) < OPCODES.len() {
            Ok(OPCODES[id as usize])
        } else {
            Err(Error::new(
                ErrorKind::MalformedInstruction,
                format!("unknown opcode id {}", id),
            ))
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Load   => "LOAD",
            Opcode::Loada  => "LOADA",
            Opcode::Loadi  => "LOADI",
            Opcode::Loadl  => "LOADL",
            Opcode::Store  => "STORE",
            Opcode::Storei => "STOREI",
            Opcode::Call   => "CALL",
            Opcode::Calli  => "CALLI",
            Opcode::Return => "RETURN",
            Opcode::Push   => "PUSH",
            Opcode::Pop    => "POP",
            Opcode::Jump   => "JUMP",
            Opcode::Jumpi  => "JUMPI",
            Opcode::Jumpif => "JUMPIF",
            Opcode::Halt   => "HALT",
        }
    }

    pub fn has_register(self) -> bool {
        match self {
            Opcode::Load
            | Opcode::Loada
            | Opcode::Store
            | Opcode::Call
            | Opcode::Jump
            | Opcode::Jumpif => true,
            _ => false,
        }
    }

    pub fn uses_n(self) -> bool {
        match self {
            Opcode::Load
            | Opcode::Loadi
            | Opcode::Store
            | Opcode::Storei
            | Opcode::Return
            | Opcode::Pop
            | Opcode::Jumpif => true,
            _ => false,
        }
    }

    pub fn uses_d(self) -> bool {
        match self {
            Opcode::Load
            | Opcode::Loada
            | Opcode::Loadl
            | Opcode::Store
            | Opcode::Call
            | Opcode::Return
            | Opcode::Push
            | Opcode::Pop
            | Opcode::Jump
            | Opcode::Jumpif => true,
            _ => false,
        }
    }
}


// The eight machine registers, numbered 0..8.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Register {
    CB,
    CT,
    PB,
    PT,
    SB,
    ST,
    LB,
    CP,
}

const REGISTERS: [Register; 8] = [
    Register::CB,
    Register::CT,
    Register::PB,
    Register::PT,
    Register::SB,
    Register::ST,
    Register::LB,
    Register::CP,
];

impl Register {
    pub fn id(self) -> i32 {
        REGISTERS.iter().position(|r| *r == self).unwrap() as i32
    }

    pub fn from_id(id: i32) -> Result<Register> {
        if id >= 0 && (id as usize) < REGISTERS.len() {
            Ok(REGISTERS[id as usize])
        } else {
            Err(Error::new(
                ErrorKind::MalformedInstruction,
                format!("unknown register id {}", id),
            ))
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Register::CB => "CB",
            Register::CT => "CT",
            Register::PB => "PB",
            Register::PT => "PT",
            Register::SB => "SB",
            Register::ST => "ST",
            Register::LB => "LB",
            Register::CP => "CP",
        }
    }

    // Drives the result tag of LOADA: code registers produce code
    // addresses, stack registers stack addresses.
    pub fn is_code_register(self) -> bool {
        match self {
            Register::CB
            | Register::CT
            | Register::PB
            | Register::PT
            | Register::CP => true,
            Register::SB | Register::ST | Register::LB => false,
        }
    }
}


#[derive(Clone, Debug, PartialEq)]
pub enum DebugSymbol {
    Comment(String, bool),
    Location(SourceLocation),
    Type(TypeTag),
    Name(String),
    Label(String),
    BreakPoint,
}

const KIND_COMMENT: i32 = 0;
const KIND_LOCATION: i32 = 1;
const KIND_TYPE: i32 = 2;
const KIND_NAME: i32 = 3;
const KIND_LABEL: i32 = 4;


#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub register: Option<Register>,
    pub n: i32,
    pub d: i32,
    symbols: Vec<DebugSymbol>,
}

impl Instruction {
    pub fn new(opcode: Opcode, register: Option<Register>, n: i32, d: i32) -> Instruction {
        Instruction { opcode, register, n, d, symbols: Vec::new() }
    }

    pub fn symbols(&self) -> &[DebugSymbol] {
        &self.symbols
    }

    pub fn attach(&mut self, symbol: DebugSymbol) {
        self.symbols.push(symbol);
    }

    pub fn clear_symbols(&mut self) {
        self.symbols.clear();
    }

    // The value type attached by the compiler; LOADL and PUSH consult
    // it for the tag of the word they materialize.
    pub fn value_type(&self) -> Option<TypeTag> {
        self.symbols.iter().find_map(|s| match s {
            DebugSymbol::Type(t) => Some(*t),
            _ => None,
        })
    }

    pub fn location(&self) -> Option<SourceLocation> {
        self.symbols.iter().find_map(|s| match s {
            DebugSymbol::Location(loc) => Some(*loc),
            _ => None,
        })
    }

    pub fn has_break_point(&self) -> bool {
        self.symbols.iter().any(|s| *s == DebugSymbol::BreakPoint)
    }
}


// One line of the derived disassembly view.
#[derive(Clone, Debug, PartialEq)]
pub enum DisasmLine {
    Blank,
    Comment(String),
    Label(String),
    Instruction { address: i32, text: String },
}

impl std::fmt::Display for DisasmLine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DisasmLine::Blank => Ok(()),
            DisasmLine::Comment(text) => write!(f, "; {}", text),
            DisasmLine::Label(name) => write!(f, "{}:", name),
            DisasmLine::Instruction { address, text } => {
                write!(f, "{:5}:  {}", address, text)
            }
        }
    }
}

fn render_instruction(inst: &Instruction) -> String {
    let mut text = format!("{:-7}", inst.opcode.mnemonic());
    if let Some(r) = inst.register {
        text.push_str(&format!(" {}", r.name()));
    }
    if inst.opcode.uses_n() {
        text.push_str(&format!(" {}", inst.n));
    }
    if inst.opcode.uses_d() {
        text.push_str(&format!(" {}", inst.d));
    }
    text
}


#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    instructions: Vec<Instruction>,
    strings: Vec<String>,
}

impl Image {
    pub fn new(instructions: Vec<Instruction>, strings: Vec<String>) -> Image {
        Image { instructions, strings }
    }

    pub fn instruction_count(&self) -> i32 {
        self.instructions.len() as i32
    }

    pub fn get_instruction(&self, addr: i32) -> Result<&Instruction> {
        if addr >= 0 && (addr as usize) < self.instructions.len() {
            Ok(&self.instructions[addr as usize])
        } else {
            Err(Error::invalid_address(addr))
        }
    }

    pub fn get_instruction_mut(&mut self, addr: i32) -> Result<&mut Instruction> {
        if addr >= 0 && (addr as usize) < self.instructions.len() {
            Ok(&mut self.instructions[addr as usize])
        } else {
            Err(Error::invalid_address(addr))
        }
    }

    pub fn string_count(&self) -> i32 {
        self.strings.len() as i32
    }

    pub fn get_string(&self, id: i32) -> Result<&str> {
        if id >= 0 && (id as usize) < self.strings.len() {
            Ok(&self.strings[id as usize])
        } else {
            Err(Error::new(
                ErrorKind::InvalidAddress,
                format!("string id {} out of range", id),
            ))
        }
    }

    // Break points are the one mutable aspect of a loaded image.
    pub fn set_break_point(&mut self, addr: i32) -> Result<()> {
        let inst = self.get_instruction_mut(addr)?;
        if !inst.has_break_point() {
            inst.attach(DebugSymbol::BreakPoint);
        }
        Ok(())
    }

    pub fn clear_break_point(&mut self, addr: i32) -> Result<()> {
        let inst = self.get_instruction_mut(addr)?;
        inst.symbols.retain(|s| *s != DebugSymbol::BreakPoint);
        Ok(())
    }

    pub fn clear_all_break_points(&mut self) {
        for inst in self.instructions.iter_mut() {
            inst.symbols.retain(|s| *s != DebugSymbol::BreakPoint);
        }
    }

    pub fn save(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<BigEndian>(self.instructions.len() as i32)?;
        for inst in &self.instructions {
            w.write_i32::<BigEndian>(inst.opcode.id())?;
            w.write_i32::<BigEndian>(inst.register.map_or(0, Register::id))?;
            w.write_i32::<BigEndian>(inst.n)?;
            w.write_i32::<BigEndian>(inst.d)?;
        }
        w.write_i32::<BigEndian>(self.strings.len() as i32)?;
        for s in &self.strings {
            write_utf(w, s)?;
        }
        Ok(())
    }

    pub fn load(r: &mut impl Read) -> Result<Image> {
        let count = r.read_i32::<BigEndian>()?;
        if count < 0 {
            return Err(Error::io("negative instruction count"));
        }
        let mut instructions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let opcode = Opcode::from_id(r.read_i32::<BigEndian>()?)?;
            let reg_id = r.read_i32::<BigEndian>()?;
            let register = if opcode.has_register() {
                Some(Register::from_id(reg_id)?)
            } else {
                None
            };
            let n = r.read_i32::<BigEndian>()?;
            let d = r.read_i32::<BigEndian>()?;
            instructions.push(Instruction::new(opcode, register, n, d));
        }
        let string_count = r.read_i32::<BigEndian>()?;
        if string_count < 0 {
            return Err(Error::io("negative string count"));
        }
        let mut strings = Vec::with_capacity(string_count as usize);
        for _ in 0..string_count {
            strings.push(read_utf(r)?);
        }
        debug!(
            "loaded image: {} instructions, {} strings",
            instructions.len(),
            strings.len()
        );
        Ok(Image { instructions, strings })
    }

    pub fn save_symbols(&self, w: &mut impl Write) -> Result<()> {
        let carriers: Vec<(i32, Vec<&DebugSymbol>)> = self
            .instructions
            .iter()
            .enumerate()
            .map(|(i, inst)| {
                let persisted: Vec<&DebugSymbol> = inst
                    .symbols
                    .iter()
                    .filter(|s| **s != DebugSymbol::BreakPoint)
                    .collect();
                (i as i32, persisted)
            })
            .filter(|(_, symbols)| !symbols.is_empty())
            .collect();

        w.write_i32::<BigEndian>(carriers.len() as i32)?;
        for (index, symbols) in carriers {
            w.write_i32::<BigEndian>(index)?;
            w.write_i32::<BigEndian>(symbols.len() as i32)?;
            for symbol in symbols {
                match symbol {
                    DebugSymbol::Comment(text, show) => {
                        w.write_i32::<BigEndian>(KIND_COMMENT)?;
                        write_utf(w, text)?;
                        w.write_i32::<BigEndian>(*show as i32)?;
                    }
                    DebugSymbol::Location(loc) => {
                        w.write_i32::<BigEndian>(KIND_LOCATION)?;
                        w.write_i32::<BigEndian>(loc.line)?;
                        w.write_i32::<BigEndian>(loc.column)?;
                    }
                    DebugSymbol::Type(tag) => {
                        w.write_i32::<BigEndian>(KIND_TYPE)?;
                        w.write_i32::<BigEndian>(tag.id())?;
                    }
                    DebugSymbol::Name(name) => {
                        w.write_i32::<BigEndian>(KIND_NAME)?;
                        write_utf(w, name)?;
                    }
                    DebugSymbol::Label(label) => {
                        w.write_i32::<BigEndian>(KIND_LABEL)?;
                        write_utf(w, label)?;
                    }
                    DebugSymbol::BreakPoint => unreachable!(),
                }
            }
        }
        Ok(())
    }

    pub fn load_symbols(&mut self, r: &mut impl Read) -> Result<()> {
        let carriers = r.read_i32::<BigEndian>()?;
        for _ in 0..carriers {
            let index = r.read_i32::<BigEndian>()?;
            let count = r.read_i32::<BigEndian>()?;
            for _ in 0..count {
                let symbol = match r.read_i32::<BigEndian>()? {
                    KIND_COMMENT => {
                        let text = read_utf(r)?;
                        let show = r.read_i32::<BigEndian>()? != 0;
                        DebugSymbol::Comment(text, show)
                    }
                    KIND_LOCATION => {
                        let line = r.read_i32::<BigEndian>()?;
                        let column = r.read_i32::<BigEndian>()?;
                        DebugSymbol::Location(SourceLocation::new(line, column))
                    }
                    KIND_TYPE => DebugSymbol::Type(TypeTag::from_id(
                        r.read_i32::<BigEndian>()?,
                    )?),
                    KIND_NAME => DebugSymbol::Name(read_utf(r)?),
                    KIND_LABEL => DebugSymbol::Label(read_utf(r)?),
                    kind => {
                        return Err(Error::io(format!(
                            "unknown debug symbol kind {}",
                            kind
                        )))
                    }
                };
                self.get_instruction_mut(index)?.attach(symbol);
            }
        }
        Ok(())
    }

    pub fn save_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.save(&mut w)
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Image> {
        let mut r = BufReader::new(File::open(path)?);
        Image::load(&mut r)
    }

    pub fn save_symbols_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.save_symbols(&mut w)
    }

    pub fn load_symbols_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let mut r = BufReader::new(File::open(path)?);
        self.load_symbols(&mut r)
    }

    // Derived, read-only listing. Labels attached to instruction i
    // precede it, each introduced by a blank line; comments render
    // only when their show flag is set.
    pub fn disassemble(&self) -> Vec<DisasmLine> {
        let mut lines = Vec::new();
        for (address, inst) in self.instructions.iter().enumerate() {
            for symbol in &inst.symbols {
                match symbol {
                    DebugSymbol::Comment(text, true) => {
                        lines.push(DisasmLine::Comment(text.clone()));
                    }
                    DebugSymbol::Label(name) => {
                        lines.push(DisasmLine::Blank);
                        lines.push(DisasmLine::Label(name.clone()));
                    }
                    _ => {}
                }
            }
            lines.push(DisasmLine::Instruction {
                address: address as i32,
                text: render_instruction(inst),
            });
        }
        lines
    }
}


fn write_utf(w: &mut impl Write, s: &str) -> Result<()> {
    let mut buf: Vec<u8> = Vec::with_capacity(s.len());
    for c in s.chars() {
        let cp = c as u32;
        if cp >= 1 && cp <= 0x7F {
            buf.push(cp as u8);
        } else if cp <= 0x7FF {
            // covers NUL, which modified UTF-8 encodes as C0 80
            buf.push(0xC0 | (cp >> 6) as u8);
            buf.push(0x80 | (cp & 0x3F) as u8);
        } else if cp <= 0xFFFF {
            buf.push(0xE0 | (cp >> 12) as u8);
            buf.push(0x80 | ((cp >> 6) & 0x3F) as u8);
            buf.push(0x80 | (cp & 0x3F) as u8);
        } else {
            // supplementary plane: CESU-8 surrogate pair
            let v = cp - 0x1_0000;
            let halves = [0xD800 + (v >> 10), 0xDC00 + (v & 0x3FF)];
            for half in &halves {
                buf.push(0xE0 | (half >> 12) as u8);
                buf.push(0x80 | ((half >> 6) & 0x3F) as u8);
                buf.push(0x80 | (half & 0x3F) as u8);
            }
        }
    }
    if buf.len() > u16::max_value() as usize {
        return Err(Error::io("string constant exceeds 65535 bytes"));
    }
    w.write_u16::<BigEndian>(buf.len() as u16)?;
    w.write_all(&buf)?;
    Ok(())
}

fn read_utf(r: &mut impl Read) -> Result<String> {
    let len = r.read_u16::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;

    let malformed = || Error::io("malformed modified UTF-8 string");

    // Decode one three-byte group, returning the raw 16-bit unit.
    fn unit16(buf: &[u8], i: usize) -> Option<u32> {
        if i + 2 >= buf.len() {
            return None;
        }
        let (a, b, c) = (buf[i] as u32, buf[i + 1] as u32, buf[i + 2] as u32);
        if a & 0xF0 != 0xE0 || b & 0xC0 != 0x80 || c & 0xC0 != 0x80 {
            return None;
        }
        Some(((a & 0x0F) << 12) | ((b & 0x3F) << 6) | (c & 0x3F))
    }

    let mut out = String::with_capacity(len);
    let mut i = 0;
    while i < len {
        let a = buf[i] as u32;
        let cp = if a & 0x80 == 0 {
            i += 1;
            a
        } else if a & 0xE0 == 0xC0 {
            if i + 1 >= len || buf[i + 1] & 0xC0 != 0x80 {
                return Err(malformed());
            }
            let b = buf[i + 1] as u32;
            i += 2;
            ((a & 0x1F) << 6) | (b & 0x3F)
        } else if a & 0xF0 == 0xE0 {
            let hi = unit16(&buf, i).ok_or_else(malformed)?;
            i += 3;
            if hi >= 0xD800 && hi < 0xDC00 {
                // CESU-8 surrogate pair
                let lo = unit16(&buf, i).ok_or_else(malformed)?;
                if lo < 0xDC00 || lo > 0xDFFF {
                    return Err(malformed());
                }
                i += 3;
                0x1_0000 + ((hi - 0xD800) << 10) + (lo - 0xDC00)
            } else {
                hi
            }
        } else {
            return Err(malformed());
        };
        out.push(std::char::from_u32(cp).ok_or_else(malformed)?);
    }
    Ok(out)
}
