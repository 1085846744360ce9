// The assembler: a two-pass emitter over a growing instruction
// vector.
//
// Forward references are the whole game here. A function may be
// called before its body is emitted, so unresolved CALLs carry d = -1
// and are recorded in a patch table keyed by the callee; emitting the
// function's entry patches every waiting site. Forward jumps work the
// same way, one site at a time, through back_patch_jump.
//
// The first two instructions of every image are scaffolding: a CALL
// to main (patched when main is added) and the HALT it returns to.
//
// String constants are interned into a dense pool: the first
// insertion assigns the next id, later lookups reuse it.

use std::collections::HashMap;

use crate::ast::FuncId;
use crate::error::{Error, Result, SourceLocation};
use crate::image::{DebugSymbol, Image, Instruction, Opcode, Register};
use crate::primitives::Primitive;
use crate::value::TypeTag;

// Words 0[LB] and 1[LB] hold the dynamic link and return address.
pub const FRAME_HEADER_SIZE: i32 = 2;

const BOUNDS_MESSAGE: &str = "Index out of bounds";


pub struct Assembler {
    instructions: Vec<Instruction>,
    strings: Vec<String>,
    string_ids: HashMap<String, i32>,
    functions: HashMap<FuncId, i32>,
    forward_calls: HashMap<FuncId, Vec<usize>>,
    next_offset: i32,
    pending: Vec<DebugSymbol>,
    context: Vec<SourceLocation>,
}

impl Assembler {
    pub fn new() -> Assembler {
        let mut asm = Assembler {
            instructions: Vec::new(),
            strings: Vec::new(),
            string_ids: HashMap::new(),
            functions: HashMap::new(),
            forward_calls: HashMap::new(),
            next_offset: FRAME_HEADER_SIZE,
            pending: Vec::new(),
            context: Vec::new(),
        };
        // entry scaffolding: call main, then halt
        asm.attach(DebugSymbol::Comment(String::from("entry"), true));
        asm.emit(Opcode::Call, Some(Register::CB), 0, -1);
        asm.emit(Opcode::Halt, None, 0, 0);
        asm
    }

    // Address of the next instruction to be emitted.
    pub fn here(&self) -> i32 {
        self.instructions.len() as i32
    }

    pub fn next_offset(&self) -> i32 {
        self.next_offset
    }

    // Claim size words of the current frame; returns the slot's
    // LB-relative offset.
    pub fn alloc_local(&mut self, size: i32) -> i32 {
        let at = self.next_offset;
        self.next_offset += size;
        at
    }

    // Leave a block scope: discard whatever the block declared beyond
    // the snapshot and restore the bookkeeping.
    pub fn reset_next_offset(&mut self, old: i32) {
        let current = self.next_offset;
        if current > old {
            self.emit(Opcode::Pop, None, 0, current - old);
        }
        self.next_offset = old;
    }

    // Stage a symbol for the next emitted instruction.
    pub fn attach(&mut self, symbol: DebugSymbol) {
        self.pending.push(symbol);
    }

    pub fn push_context(&mut self, loc: SourceLocation) {
        self.context.push(loc);
    }

    pub fn pop_context(&mut self) {
        self.context.pop();
    }

    pub fn emit(
        &mut self,
        opcode: Opcode,
        register: Option<Register>,
        n: i32,
        d: i32,
    ) -> usize {
        let mut inst = Instruction::new(opcode, register, n, d);
        for symbol in self.pending.drain(..) {
            inst.attach(symbol);
        }
        if let Some(loc) = self.context.last() {
            inst.attach(DebugSymbol::Location(*loc));
        }
        self.instructions.push(inst);
        self.instructions.len() - 1
    }

    pub fn emit_loadl(&mut self, tag: TypeTag, bits: i32) -> usize {
        self.attach(DebugSymbol::Type(tag));
        self.emit(Opcode::Loadl, None, 0, bits)
    }

    pub fn emit_push(&mut self, size: i32, tag: TypeTag) -> usize {
        self.attach(DebugSymbol::Type(tag));
        self.emit(Opcode::Push, None, 0, size)
    }

    // Record a function entry: back-patch every deferred call to it,
    // rewrite the initial CALL if this is main, and reset the local
    // offset past the frame header.
    pub fn add_new_function(&mut self, id: FuncId, name: &str) {
        let addr = self.here();
        debug!("function {} at {}", name, addr);
        if name == "main" {
            self.instructions[0].d = addr;
        }
        if let Some(sites) = self.forward_calls.remove(&id) {
            for site in sites {
                debug!("back-patching call at {} to {}", site, addr);
                self.instructions[site].d = addr;
            }
        }
        self.functions.insert(id, addr);
        self.next_offset = FRAME_HEADER_SIZE;
        self.attach(DebugSymbol::Label(String::from(name)));
        self.attach(DebugSymbol::Name(String::from(name)));
    }

    pub fn function_address(&self, id: FuncId) -> Option<i32> {
        self.functions.get(&id).copied()
    }

    // Call a user function, deferring the target if it is not known
    // yet.
    pub fn call_function(&mut self, id: FuncId) -> usize {
        if let Some(&addr) = self.functions.get(&id) {
            self.emit(Opcode::Call, Some(Register::CB), 0, addr)
        } else {
            let site = self.emit(Opcode::Call, Some(Register::CB), 0, -1);
            self.forward_calls.entry(id).or_insert_with(Vec::new).push(site);
            site
        }
    }

    pub fn call_primitive(&mut self, p: Primitive) -> usize {
        self.emit(Opcode::Call, Some(Register::PB), 0, p.displacement())
    }

    pub fn intern_string(&mut self, s: &str) -> i32 {
        if let Some(&id) = self.string_ids.get(s) {
            return id;
        }
        let id = self.strings.len() as i32;
        self.strings.push(String::from(s));
        self.string_ids.insert(String::from(s), id);
        id
    }

    // Forward jumps: emit with d = -1, patch once the target exists.
    pub fn emit_jump(&mut self) -> usize {
        self.emit(Opcode::Jump, Some(Register::CB), 0, -1)
    }

    pub fn emit_jump_to(&mut self, addr: i32) -> usize {
        self.emit(Opcode::Jump, Some(Register::CB), 0, addr)
    }

    pub fn emit_jump_if(&mut self, n: i32) -> usize {
        self.emit(Opcode::Jumpif, Some(Register::CB), n, -1)
    }

    pub fn emit_jump_if_to(&mut self, n: i32, addr: i32) -> usize {
        self.emit(Opcode::Jumpif, Some(Register::CB), n, addr)
    }

    pub fn back_patch_jump(&mut self, site: usize, addr: i32) -> Result<()> {
        match self.instructions[site].opcode {
            Opcode::Jump | Opcode::Jumpif => {
                self.instructions[site].d = addr;
                Ok(())
            }
            op => Err(Error::internal(format!(
                "back-patch target at {} is {}, not a jump",
                site,
                op.mnemonic()
            ))),
        }
    }

    // Check that the integer on top of the stack lies in
    // [lower, upper); out of range raises "Index out of bounds"
    // through the err primitive. The checked value survives
    // untouched.
    pub fn emit_bounds_check(&mut self, lower: i32, upper: i32) -> Result<()> {
        self.emit(Opcode::Load, Some(Register::ST), 1, -1); // dup
        self.emit_loadl(TypeTag::Int, lower);
        self.call_primitive(Primitive::LtI);
        let fail_low = self.emit_jump_if(1);
        self.emit(Opcode::Load, Some(Register::ST), 1, -1); // dup
        self.emit_loadl(TypeTag::Int, upper);
        self.call_primitive(Primitive::GeI);
        let fail_high = self.emit_jump_if(1);
        let done = self.emit_jump();

        let fail = self.here();
        self.back_patch_jump(fail_low, fail)?;
        self.back_patch_jump(fail_high, fail)?;
        let id = self.intern_string(BOUNDS_MESSAGE);
        self.emit_loadl(TypeTag::StringId, id);
        self.call_primitive(Primitive::Err);

        let end = self.here();
        self.back_patch_jump(done, end)?;
        Ok(())
    }

    // Freeze the image. Every referenced callee must have been added
    // by now; a surviving d = -1 call is a compiler bug.
    pub fn finish(self) -> Result<Image> {
        if !self.forward_calls.is_empty() {
            return Err(Error::internal(format!(
                "{} function(s) called but never emitted",
                self.forward_calls.len()
            )));
        }
        if self.instructions[0].d < 0 {
            return Err(Error::internal("no main function was added"));
        }
        Ok(Image::new(self.instructions, self.strings))
    }

    // Peek at an emitted instruction; used by tests and the code
    // generator's own assertions.
    pub fn instruction(&self, site: usize) -> &Instruction {
        &self.instructions[site]
    }
}
