// Machine state: the register file, linear word memory, profiler and
// error latch.
//
// Memory is one dense array of tagged words; the stack grows upward
// from SB = 0 and only [SB, ST) counts as defined. Code lives in a
// virtual region of its own: CB..CT are real instructions, PB..PT the
// primitives, so any address >= PB names a primitive call.
//
// Every register and memory touch is counted by the Profiler. The
// first failing operation latches an Error into the execution state;
// from then on the machine refuses further work until reset.

use crate::error::{Error, ErrorKind, Result};
use crate::image::Register;
use crate::primitives::PRIMITIVE_COUNT;
use crate::value::{TypeTag, Value};

pub const DEFAULT_MEMORY_SIZE: usize = 1 << 20;

// Size of the virtual code region; PB = MAX_CODE_SIZE - PRIMITIVE_COUNT.
pub const MAX_CODE_SIZE: i32 = 1 << 16;


#[derive(Clone, Debug, PartialEq)]
pub enum ExecState {
    Running,
    Halted,
    Error(Error),
}


// Access counters, kept as an explicit record rather than globals so
// embedders (and tests) can read them per run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Profiler {
    pub register_reads: u64,
    pub register_writes: u64,
    pub memory_reads: u64,
    pub memory_writes: u64,
    pub cycles: u64,
}


pub struct Machine {
    registers: [Value; 8],
    memory: Vec<Value>,
    state: ExecState,
    profiler: Profiler,
}

fn initial_registers(code_top: i32) -> [Value; 8] {
    [
        Value::CodeAddr(0),                             // CB
        Value::CodeAddr(code_top),                      // CT
        Value::CodeAddr(MAX_CODE_SIZE - PRIMITIVE_COUNT), // PB
        Value::CodeAddr(MAX_CODE_SIZE),                 // PT
        Value::StackAddr(0),                            // SB
        Value::StackAddr(0),                            // ST
        Value::StackAddr(0),                            // LB
        Value::CodeAddr(0),                             // CP
    ]
}

impl Machine {
    pub fn new(code_top: i32) -> Machine {
        Machine::with_memory_size(code_top, DEFAULT_MEMORY_SIZE)
    }

    pub fn with_memory_size(code_top: i32, memory_size: usize) -> Machine {
        Machine {
            registers: initial_registers(code_top),
            memory: vec![Value::Unknown(0); memory_size],
            state: ExecState::Running,
            profiler: Profiler::default(),
        }
    }

    pub fn memory_size(&self) -> usize {
        self.memory.len()
    }

    pub fn state(&self) -> &ExecState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ExecState::Running
    }

    pub fn halt(&mut self) {
        self.state = ExecState::Halted;
    }

    // Latch the first failure; later failures keep the original.
    pub fn set_error(&mut self, e: &Error) {
        if let ExecState::Running = self.state {
            self.state = ExecState::Error(e.clone());
        }
    }

    fn fail(&mut self, e: Error) -> Error {
        self.set_error(&e);
        e
    }

    // The dispatcher enriches the error it latched (faulting CP,
    // source location), so it may overwrite what a memory op latched
    // a moment earlier. Same failure, more context.
    pub(crate) fn latch_error(&mut self, e: &Error) {
        self.state = ExecState::Error(e.clone());
    }

    // Once latched, every operation no-ops by re-raising the latched
    // error until the machine is reset.
    fn guard(&self) -> Result<()> {
        match &self.state {
            ExecState::Error(e) => Err(e.clone()),
            _ => Ok(()),
        }
    }

    pub fn reset(&mut self) {
        let code_top = self.registers[Register::CT.id() as usize].bits();
        self.registers = initial_registers(code_top);
        for cell in self.memory.iter_mut() {
            *cell = Value::Unknown(0);
        }
        self.state = ExecState::Running;
        self.profiler = Profiler::default();
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub(crate) fn count_cycle(&mut self) {
        self.profiler.cycles += 1;
    }

    pub fn get_reg(&mut self, r: Register) -> Value {
        self.profiler.register_reads += 1;
        self.registers[r.id() as usize]
    }

    pub fn set_reg(&mut self, r: Register, v: Value) {
        self.profiler.register_writes += 1;
        self.registers[r.id() as usize] = v;
    }

    fn check_addr(&mut self, addr: i32) -> Result<usize> {
        if addr >= 0 && (addr as usize) < self.memory.len() {
            Ok(addr as usize)
        } else {
            Err(self.fail(Error::invalid_address(addr)))
        }
    }

    pub fn get_mem(&mut self, addr: i32) -> Result<Value> {
        self.guard()?;
        let index = self.check_addr(addr)?;
        self.profiler.memory_reads += 1;
        Ok(self.memory[index])
    }

    pub fn set_mem(&mut self, addr: i32, v: Value) -> Result<()> {
        self.guard()?;
        let index = self.check_addr(addr)?;
        self.profiler.memory_writes += 1;
        self.memory[index] = v;
        Ok(())
    }

    // Word-by-word copy in forward order. Overlapping regions are
    // defined by that order; POP and RETURN rely on it to slide a
    // result down over dead locals.
    pub fn copy_mem(&mut self, src: i32, dst: i32, count: i32) -> Result<()> {
        for i in 0..count {
            let v = self.get_mem(src + i)?;
            self.set_mem(dst + i, v)?;
        }
        Ok(())
    }

    pub fn zero_mem(&mut self, dst: i32, count: i32, tag: TypeTag) -> Result<()> {
        for i in 0..count {
            self.set_mem(dst + i, tag.zero())?;
        }
        Ok(())
    }

    // Grow the stack by n words; returns the previous ST.
    pub fn inc_stack(&mut self, n: i32) -> Result<i32> {
        self.guard()?;
        let st = self.get_reg(Register::ST).as_int()?;
        if st as i64 + n as i64 >= self.memory.len() as i64 {
            return Err(self.fail(Error::new(
                ErrorKind::StackOverflow,
                format!("stack limit exceeded at {}", st),
            )));
        }
        self.set_reg(Register::ST, Value::StackAddr(st + n));
        Ok(st)
    }

    // Shrink the stack by n words; returns the new ST.
    pub fn dec_stack(&mut self, n: i32) -> Result<i32> {
        self.guard()?;
        let st = self.get_reg(Register::ST).as_int()?;
        let sb = self.get_reg(Register::SB).as_int()?;
        let new = st - n;
        if new < sb {
            return Err(self.fail(Error::new(
                ErrorKind::StackUnderflow,
                format!("stack underflow at {}", st),
            )));
        }
        self.set_reg(Register::ST, Value::StackAddr(new));
        Ok(new)
    }

    // Move ST to an absolute position, as RETURN does.
    pub fn set_st(&mut self, st: i32) -> Result<()> {
        self.guard()?;
        let sb = self.get_reg(Register::SB).as_int()?;
        if st < sb {
            return Err(self.fail(Error::new(
                ErrorKind::StackUnderflow,
                format!("stack underflow at {}", st),
            )));
        }
        if st as i64 >= self.memory.len() as i64 {
            return Err(self.fail(Error::new(
                ErrorKind::StackOverflow,
                format!("stack limit exceeded at {}", st),
            )));
        }
        self.set_reg(Register::ST, Value::StackAddr(st));
        Ok(())
    }

    pub fn push(&mut self, v: Value) -> Result<()> {
        let at = self.inc_stack(1)?;
        self.set_mem(at, v)
    }

    pub fn pop(&mut self) -> Result<Value> {
        let at = self.dec_stack(1)?;
        self.get_mem(at)
    }

    // CP advances without losing its code-address tag.
    pub fn inc_cp(&mut self) -> Result<()> {
        let cp = self.get_reg(Register::CP).as_int()?;
        self.set_reg(Register::CP, Value::CodeAddr(cp + 1));
        Ok(())
    }
}
