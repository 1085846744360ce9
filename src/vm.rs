// The instruction dispatcher.
//
// A fetch-execute loop drives the machine: while the execution state
// is Running, fetch the instruction at CP, dispatch to its executor,
// count the cycle. An executor that fails flips the state to Error
// with the faulting CP (and the instruction's source location, when
// it carries one) latched into the error.
//
// The loop itself never recovers: a latched error surfaces to the
// caller, and the machine refuses to run again until reset. A cycle
// budget, checked at the top of the loop, bounds runaway programs
// without marking them failed; break points pause the loop the same
// way.

use crate::config::VmConfig;
use crate::error::{Error, Result};
use crate::image::{Image, Instruction, Opcode, Register};
use crate::machine::{ExecState, Machine};
use crate::primitives::{self, Console};
use crate::value::{TypeTag, Value};


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    Halted,
    BreakPoint(i32),
    CycleLimit,
}


pub struct Vm {
    image: Image,
    machine: Machine,
    max_cycles: Option<u64>,
    trace: bool,
}

impl Vm {
    pub fn new(image: Image) -> Vm {
        let machine = Machine::new(image.instruction_count());
        Vm { image, machine, max_cycles: None, trace: false }
    }

    pub fn with_config(image: Image, config: &VmConfig) -> Vm {
        let machine =
            Machine::with_memory_size(image.instruction_count(), config.memory_size);
        Vm {
            image,
            machine,
            max_cycles: config.max_cycles,
            trace: config.trace,
        }
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut Image {
        &mut self.image
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    pub fn reset(&mut self) {
        self.machine.reset();
    }

    // Run until HALT, a latched error, the cycle budget, or a break
    // point. Resuming from a break point steps over it first.
    pub fn run(&mut self, console: &mut dyn Console) -> Result<StopReason> {
        if !self.machine.is_running() {
            return Err(Error::internal("machine requires reset before re-running"));
        }
        let mut resuming = true;
        loop {
            if let Some(max) = self.max_cycles {
                if self.machine.profiler().cycles >= max {
                    return Ok(StopReason::CycleLimit);
                }
            }
            if !resuming {
                let cp = self.machine.get_reg(Register::CP).as_int().unwrap_or(-1);
                if let Ok(inst) = self.image.get_instruction(cp) {
                    if inst.has_break_point() {
                        return Ok(StopReason::BreakPoint(cp));
                    }
                }
            }
            self.step(console)?;
            resuming = false;
            match self.machine.state() {
                ExecState::Running => continue,
                ExecState::Halted => return Ok(StopReason::Halted),
                ExecState::Error(e) => return Err(e.clone()),
            }
        }
    }

    // Execute a single instruction. Exposed so an external debugger
    // can drive the machine one cycle at a time.
    pub fn step(&mut self, console: &mut dyn Console) -> Result<()> {
        match self.machine.state() {
            ExecState::Running => {}
            ExecState::Halted => {
                return Err(Error::internal("machine is halted"));
            }
            ExecState::Error(e) => return Err(e.clone()),
        }

        let cp = match self.machine.get_reg(Register::CP).as_int() {
            Ok(cp) => cp,
            Err(e) => {
                self.machine.latch_error(&e);
                return Err(e);
            }
        };
        let inst = match self.image.get_instruction(cp) {
            Ok(inst) => inst.clone(),
            Err(e) => {
                let e = e.at(cp);
                self.machine.latch_error(&e);
                return Err(e);
            }
        };

        trace!("{:>5}  {}", cp, inst.opcode.mnemonic());
        if self.trace {
            eprintln!("{:>5}  {}", cp, inst.opcode.mnemonic());
        }

        if let Err(mut e) = self.execute(&inst, console) {
            if e.address.is_none() {
                e.address = Some(cp);
            }
            if e.location.is_none() {
                e.location = inst.location();
            }
            self.machine.latch_error(&e);
            return Err(e);
        }
        self.machine.count_cycle();
        Ok(())
    }

    fn addr(&mut self, r: Register, d: i32) -> Result<i32> {
        Ok(self.machine.get_reg(r).as_int()? + d)
    }

    fn execute(&mut self, inst: &Instruction, console: &mut dyn Console) -> Result<()> {
        let m = |inst: &Instruction| -> Result<Register> {
            inst.register
                .ok_or_else(|| Error::internal("instruction lost its register"))
        };
        match inst.opcode {
            Opcode::Load => {
                let src = self.addr(m(inst)?, inst.d)?;
                let dst = self.machine.inc_stack(inst.n)?;
                self.machine.copy_mem(src, dst, inst.n)?;
                self.machine.inc_cp()
            }
            Opcode::Loada => {
                let r = m(inst)?;
                let addr = self.addr(r, inst.d)?;
                let tag = if r.is_code_register() {
                    TypeTag::CodeAddr
                } else {
                    TypeTag::StackAddr
                };
                self.machine.push(Value::from_bits(tag, addr))?;
                self.machine.inc_cp()
            }
            Opcode::Loadi => {
                let src = self.machine.pop()?.as_int()?;
                let dst = self.machine.inc_stack(inst.n)?;
                self.machine.copy_mem(src, dst, inst.n)?;
                self.machine.inc_cp()
            }
            Opcode::Loadl => {
                let tag = inst.value_type().unwrap_or(TypeTag::Unknown);
                self.machine.push(Value::from_bits(tag, inst.d))?;
                self.machine.inc_cp()
            }
            Opcode::Store => {
                let dst = self.addr(m(inst)?, inst.d)?;
                let src = self.machine.dec_stack(inst.n)?;
                self.machine.copy_mem(src, dst, inst.n)?;
                self.machine.inc_cp()
            }
            Opcode::Storei => {
                let dst = self.machine.pop()?.as_int()?;
                let src = self.machine.dec_stack(inst.n)?;
                self.machine.copy_mem(src, dst, inst.n)?;
                self.machine.inc_cp()
            }
            Opcode::Call => {
                let r = m(inst)?;
                let target = self.addr(r, inst.d)?;
                self.enter(target, r == Register::PB, console)
            }
            Opcode::Calli => {
                let target = self.machine.pop()?.as_int()?;
                self.enter(target, false, console)
            }
            Opcode::Return => {
                let lb = self.machine.get_reg(Register::LB).as_int()?;
                let st = self.machine.get_reg(Register::ST).as_int()?;
                let dyn_link = self.machine.get_mem(lb)?;
                let ret_addr = self.machine.get_mem(lb + 1)?;
                self.machine.copy_mem(st - inst.n, lb - inst.d, inst.n)?;
                self.machine.set_st(lb - inst.d + inst.n)?;
                self.machine.set_reg(Register::LB, dyn_link);
                self.machine.set_reg(Register::CP, ret_addr);
                Ok(())
            }
            Opcode::Push => {
                let tag = inst.value_type().unwrap_or(TypeTag::Unknown);
                let base = self.machine.inc_stack(inst.d)?;
                self.machine.zero_mem(base, inst.d, tag)?;
                self.machine.inc_cp()
            }
            Opcode::Pop => {
                let st = self.machine.get_reg(Register::ST).as_int()?;
                self.machine.copy_mem(st - inst.n, st - inst.n - inst.d, inst.n)?;
                self.machine.dec_stack(inst.d)?;
                self.machine.inc_cp()
            }
            Opcode::Jump => {
                let target = self.addr(m(inst)?, inst.d)?;
                self.machine.set_reg(Register::CP, Value::CodeAddr(target));
                Ok(())
            }
            Opcode::Jumpi => {
                let target = self.machine.pop()?.as_int()?;
                self.machine.set_reg(Register::CP, Value::CodeAddr(target));
                Ok(())
            }
            Opcode::Jumpif => {
                let c = self.machine.pop()?.as_int()?;
                if c == inst.n {
                    let target = self.addr(m(inst)?, inst.d)?;
                    self.machine.set_reg(Register::CP, Value::CodeAddr(target));
                    Ok(())
                } else {
                    self.machine.inc_cp()
                }
            }
            Opcode::Halt => {
                self.machine.halt();
                Ok(())
            }
        }
    }

    // Shared tail of CALL and CALLI. Addresses at or above PB name
    // primitives; CALL through the PB register is a primitive call
    // even for displacements that land below PB.
    fn enter(
        &mut self,
        target: i32,
        force_primitive: bool,
        console: &mut dyn Console,
    ) -> Result<()> {
        let pb = self.machine.get_reg(Register::PB).as_int()?;
        if force_primitive || target >= pb {
            primitives::invoke(target - pb, &mut self.machine, &self.image, console)?;
            self.machine.inc_cp()
        } else {
            let old_lb = self.machine.get_reg(Register::LB);
            let cp = self.machine.get_reg(Register::CP).as_int()?;
            let frame = self.machine.inc_stack(2)?;
            self.machine.set_mem(frame, old_lb)?;
            self.machine.set_mem(frame + 1, Value::CodeAddr(cp + 1))?;
            self.machine.set_reg(Register::LB, Value::StackAddr(frame));
            self.machine.set_reg(Register::CP, Value::CodeAddr(target));
            Ok(())
        }
    }
}
