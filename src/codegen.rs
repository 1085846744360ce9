// The code generator: a walk over the typed AST that emits TAM
// through the assembler.
//
// Frame discipline: every declaration owns a fixed LB-relative slot,
// handed out by the assembler's next-offset counter. Parameters sit
// below LB (the caller pushed them), the frame header at 0[LB] and
// 1[LB], locals above. Block-shaped constructs snapshot the counter
// on entry and discard the slack on exit, so the runtime ST always
// equals LB + next_offset between statements.
//
// Structured values travel by copy on the stack. Element access,
// sub-structure extraction and element-wise arithmetic therefore
// address their operands relative to ST, which the stack transitions
// in the individual schemes keep track of to the word.

use std::collections::HashMap;

use crate::asm::Assembler;
use crate::ast::{
    BinOp, Callee, CastOp, DeclId, Expr, ExprKind, Function, LValue, Program, Stmt,
    StmtKind, Type, UnOp,
};
use crate::error::{Error, Result};
use crate::image::{Image, Opcode, Register};
use crate::primitives::Primitive;
use crate::value::TypeTag;


pub fn compile(program: &Program) -> Result<Image> {
    let mut cg = CodeGen::new();
    for function in &program.functions {
        cg.function(function)?;
    }
    cg.asm.finish()
}


// The word tag used to zero-initialize slots of the given type.
fn zero_tag(ty: &Type) -> TypeTag {
    match ty {
        Type::Int => TypeTag::Int,
        Type::Bool => TypeTag::Bool,
        Type::Float => TypeTag::Float,
        Type::Str => TypeTag::StringId,
        Type::Vector(t, _) | Type::Matrix(t, _, _) => zero_tag(t),
        Type::Record(_, _) | Type::Void => TypeTag::Unknown,
    }
}

// The primitive implementing a scalar operator for the given element
// type. The analysis stage has already rejected ill-typed operands.
fn scalar_primitive(op: BinOp, ty: &Type) -> Primitive {
    match (op, ty) {
        (BinOp::Add, Type::Float) => Primitive::AddF,
        (BinOp::Add, _) => Primitive::AddI,
        (BinOp::Sub, Type::Float) => Primitive::SubF,
        (BinOp::Sub, _) => Primitive::SubI,
        (BinOp::Mul, Type::Float) => Primitive::MulF,
        (BinOp::Mul, _) => Primitive::MulI,
        (BinOp::Div, Type::Float) => Primitive::DivF,
        (BinOp::Div, _) => Primitive::DivI,
        (BinOp::Mod, Type::Float) => Primitive::ModF,
        (BinOp::Mod, _) => Primitive::ModI,
        (BinOp::Pow, Type::Float) => Primitive::PowFloat,
        (BinOp::Pow, _) => Primitive::PowInt,
        (BinOp::Eq, Type::Float) => Primitive::EqF,
        (BinOp::Eq, _) => Primitive::EqI,
        (BinOp::Ne, Type::Float) => Primitive::NeF,
        (BinOp::Ne, _) => Primitive::NeI,
        (BinOp::Lt, Type::Float) => Primitive::LtF,
        (BinOp::Lt, _) => Primitive::LtI,
        (BinOp::Le, Type::Float) => Primitive::LeF,
        (BinOp::Le, _) => Primitive::LeI,
        (BinOp::Gt, Type::Float) => Primitive::GtF,
        (BinOp::Gt, _) => Primitive::GtI,
        (BinOp::Ge, Type::Float) => Primitive::GeF,
        (BinOp::Ge, _) => Primitive::GeI,
        (BinOp::And, _) => Primitive::And,
        (BinOp::Or, _) => Primitive::Or,
    }
}


enum Shape {
    StructStruct,
    StructScalar,
    ScalarStruct,
}


struct CodeGen {
    asm: Assembler,
    locals: HashMap<DeclId, (i32, Type)>,
    result_size: i32,
    params_size: i32,
}

impl CodeGen {
    fn new() -> CodeGen {
        CodeGen {
            asm: Assembler::new(),
            locals: HashMap::new(),
            result_size: 0,
            params_size: 0,
        }
    }

    fn lookup(&self, decl: DeclId) -> Result<(i32, Type)> {
        self.locals
            .get(&decl)
            .cloned()
            .ok_or_else(|| Error::internal(format!("undeclared {:?}", decl)))
    }

    fn function(&mut self, f: &Function) -> Result<()> {
        self.asm.push_context(f.loc);
        self.asm.add_new_function(f.id, &f.name);
        self.locals.clear();

        self.params_size = f.params.iter().map(|(_, t)| t.word_size()).sum();
        let mut offset = -self.params_size;
        for (decl, ty) in &f.params {
            self.locals.insert(*decl, (offset, ty.clone()));
            offset += ty.word_size();
        }
        self.result_size = f.result.word_size();

        for stmt in &f.body {
            self.statement(stmt)?;
        }
        self.asm
            .emit(Opcode::Return, None, self.result_size, self.params_size);
        self.asm.pop_context();
        Ok(())
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<()> {
        let mark = self.asm.next_offset();
        for stmt in stmts {
            self.statement(stmt)?;
        }
        self.asm.reset_next_offset(mark);
        Ok(())
    }

    fn statement(&mut self, stmt: &Stmt) -> Result<()> {
        self.asm.push_context(stmt.loc);
        let result = self.statement_inner(stmt);
        self.asm.pop_context();
        result
    }

    fn statement_inner(&mut self, stmt: &Stmt) -> Result<()> {
        match &stmt.kind {
            // A value definition leaves the initializer's words in
            // place: they become the slot.
            StmtKind::Val { decl, ty, init } => {
                self.expression(init)?;
                let offset = self.asm.alloc_local(ty.word_size());
                self.locals.insert(*decl, (offset, ty.clone()));
                Ok(())
            }
            StmtKind::Var { decl, ty } => {
                self.asm.emit_push(ty.word_size(), zero_tag(ty));
                let offset = self.asm.alloc_local(ty.word_size());
                self.locals.insert(*decl, (offset, ty.clone()));
                Ok(())
            }
            StmtKind::Assign { target, value } => {
                self.expression(value)?;
                let size = value.ty.word_size();
                self.lvalue_address(target)?;
                self.asm.emit(Opcode::Storei, None, size, 0);
                Ok(())
            }
            StmtKind::Expr(e) => {
                self.expression(e)?;
                let size = e.ty.word_size();
                if size > 0 {
                    self.asm.emit(Opcode::Pop, None, 0, size);
                }
                Ok(())
            }
            StmtKind::Block(stmts) => self.block(stmts),
            StmtKind::If { cond, then_body, else_body } => {
                self.expression(cond)?;
                let to_else = self.asm.emit_jump_if(0);
                self.block(then_body)?;
                let to_end = self.asm.emit_jump();
                let here = self.asm.here();
                self.asm.back_patch_jump(to_else, here)?;
                self.block(else_body)?;
                let here = self.asm.here();
                self.asm.back_patch_jump(to_end, here)
            }
            StmtKind::For { var, ty, init, cond, step_var, step, body } => {
                let mark = self.asm.next_offset();
                self.expression(init)?;
                let offset = self.asm.alloc_local(ty.word_size());
                self.locals.insert(*var, (offset, ty.clone()));

                let to_cond = self.asm.emit_jump();
                let body_start = self.asm.here();
                self.block(body)?;

                // increment: evaluate and store to the step variable
                self.expression(step)?;
                let (step_off, step_ty) = self.lookup(*step_var)?;
                self.asm.emit(Opcode::Loada, Some(Register::LB), 0, step_off);
                self.asm
                    .emit(Opcode::Storei, None, step_ty.word_size(), 0);

                let here = self.asm.here();
                self.asm.back_patch_jump(to_cond, here)?;
                self.expression(cond)?;
                self.asm.emit_jump_if_to(1, body_start);

                self.asm.reset_next_offset(mark);
                Ok(())
            }
            StmtKind::ForEach { iter, ty, mutable, source, body } => {
                self.for_each(*iter, ty, *mutable, *source, body)
            }
            StmtKind::Switch { disc, cases, default } => {
                let mark = self.asm.next_offset();
                // evaluate the discriminant once into a synthetic
                // local, reloaded per case
                self.expression(disc)?;
                let disc_off = self.asm.alloc_local(1);

                let mut to_end = Vec::new();
                for (value, body) in cases {
                    self.asm.emit(Opcode::Load, Some(Register::LB), 1, disc_off);
                    self.asm.emit_loadl(TypeTag::Int, *value);
                    self.asm.call_primitive(Primitive::EqI);
                    let to_next = self.asm.emit_jump_if(0);
                    self.block(body)?;
                    to_end.push(self.asm.emit_jump());
                    let here = self.asm.here();
                    self.asm.back_patch_jump(to_next, here)?;
                }
                if let Some(body) = default {
                    self.block(body)?;
                }
                let end = self.asm.here();
                for site in to_end {
                    self.asm.back_patch_jump(site, end)?;
                }
                self.asm.reset_next_offset(mark);
                Ok(())
            }
            // The result words stay on top of the stack; the RETURN
            // opcode itself is emitted once, after the function's
            // last statement.
            StmtKind::Return(expr) => {
                if let Some(e) = expr {
                    self.expression(e)?;
                }
                Ok(())
            }
        }
    }

    // Iterate the words of a structured variable through a one-word
    // iterator slot. Layout during the loop, relative to LB:
    // iterator at iter_off, index counter right above it.
    fn for_each(
        &mut self,
        iter: DeclId,
        ty: &Type,
        mutable: bool,
        source: DeclId,
        body: &[Stmt],
    ) -> Result<()> {
        let mark = self.asm.next_offset();
        let (src_off, src_ty) = self.lookup(source)?;
        let size = src_ty.word_size();

        self.asm.emit_push(1, zero_tag(ty));
        let iter_off = self.asm.alloc_local(1);
        self.locals.insert(iter, (iter_off, ty.clone()));
        // the index counter starts at PUSH's typed zero
        self.asm.emit_push(1, TypeTag::Int);
        let idx_off = self.asm.alloc_local(1);

        let to_cond = self.asm.emit_jump();
        let body_start = self.asm.here();

        // iterator = *(&source + i)
        self.asm.emit(Opcode::Loada, Some(Register::LB), 0, src_off);
        self.asm.emit(Opcode::Load, Some(Register::LB), 1, idx_off);
        self.asm.call_primitive(Primitive::AddI);
        self.asm.emit(Opcode::Loadi, None, 1, 0);
        self.asm.emit(Opcode::Loada, Some(Register::LB), 0, iter_off);
        self.asm.emit(Opcode::Storei, None, 1, 0);

        self.block(body)?;

        if mutable {
            // write the possibly-modified word back
            self.asm.emit(Opcode::Load, Some(Register::LB), 1, iter_off);
            self.asm.emit(Opcode::Loada, Some(Register::LB), 0, src_off);
            self.asm.emit(Opcode::Load, Some(Register::LB), 1, idx_off);
            self.asm.call_primitive(Primitive::AddI);
            self.asm.emit(Opcode::Storei, None, 1, 0);
        }

        // i += 1
        self.asm.emit(Opcode::Load, Some(Register::LB), 1, idx_off);
        self.asm.call_primitive(Primitive::Succ);
        self.asm.emit(Opcode::Loada, Some(Register::LB), 0, idx_off);
        self.asm.emit(Opcode::Storei, None, 1, 0);

        let here = self.asm.here();
        self.asm.back_patch_jump(to_cond, here)?;
        self.asm.emit(Opcode::Load, Some(Register::LB), 1, idx_off);
        self.asm.emit_loadl(TypeTag::Int, size);
        self.asm.call_primitive(Primitive::LtI);
        self.asm.emit_jump_if_to(1, body_start);

        self.asm.reset_next_offset(mark);
        Ok(())
    }

    // Push the destination address of an assignment.
    fn lvalue_address(&mut self, lv: &LValue) -> Result<()> {
        match lv {
            LValue::Id(decl) => {
                let (offset, _) = self.lookup(*decl)?;
                self.asm.emit(Opcode::Loada, Some(Register::LB), 0, offset);
                Ok(())
            }
            LValue::VectorElement(decl, index) => {
                let (offset, ty) = self.lookup(*decl)?;
                let dim = match &ty {
                    Type::Vector(_, n) => *n as i32,
                    _ => return Err(Error::internal("indexing a non-vector")),
                };
                self.asm.emit(Opcode::Loada, Some(Register::LB), 0, offset);
                self.expression(index)?;
                self.asm.emit_bounds_check(0, dim)?;
                self.asm.call_primitive(Primitive::AddI);
                Ok(())
            }
            LValue::MatrixElement(decl, row, col) => {
                let (offset, ty) = self.lookup(*decl)?;
                let (rows, cols) = match &ty {
                    Type::Matrix(_, r, c) => (*r as i32, *c as i32),
                    _ => return Err(Error::internal("indexing a non-matrix")),
                };
                self.asm.emit(Opcode::Loada, Some(Register::LB), 0, offset);
                self.expression(row)?;
                self.asm.emit_bounds_check(0, rows)?;
                self.asm.emit_loadl(TypeTag::Int, cols);
                self.asm.call_primitive(Primitive::MulI);
                self.asm.call_primitive(Primitive::AddI);
                self.expression(col)?;
                self.asm.emit_bounds_check(0, cols)?;
                self.asm.call_primitive(Primitive::AddI);
                Ok(())
            }
            LValue::Field(decl, name) => {
                let (offset, ty) = self.lookup(*decl)?;
                let field = ty
                    .field_offset(name)
                    .ok_or_else(|| Error::internal(format!("no field {}", name)))?;
                self.asm
                    .emit(Opcode::Loada, Some(Register::LB), 0, offset + field);
                Ok(())
            }
        }
    }

    // Emit code leaving e.ty.word_size() words on top of the stack.
    fn expression(&mut self, e: &Expr) -> Result<()> {
        match &e.kind {
            ExprKind::Int(v) => {
                self.asm.emit_loadl(TypeTag::Int, *v);
                Ok(())
            }
            ExprKind::Bool(v) => {
                self.asm.emit_loadl(TypeTag::Bool, *v as i32);
                Ok(())
            }
            ExprKind::Float(v) => {
                self.asm.emit_loadl(TypeTag::Float, v.to_bits() as i32);
                Ok(())
            }
            ExprKind::Str(s) => {
                let id = self.asm.intern_string(s);
                self.asm.emit_loadl(TypeTag::StringId, id);
                Ok(())
            }
            ExprKind::Var(decl) => {
                let (offset, ty) = self.lookup(*decl)?;
                self.asm
                    .emit(Opcode::Load, Some(Register::LB), ty.word_size(), offset);
                Ok(())
            }
            ExprKind::Unary(op, operand) => {
                self.expression(operand)?;
                let p = match (op, &operand.ty) {
                    (UnOp::Not, _) => Primitive::Not,
                    (UnOp::Neg, Type::Float) => Primitive::NegF,
                    (UnOp::Neg, _) => Primitive::NegI,
                };
                self.asm.call_primitive(p);
                Ok(())
            }
            ExprKind::Binary(op, l, r) => self.binary(*op, l, r),
            ExprKind::Cast(op, operand) => {
                self.expression(operand)?;
                let p = match op {
                    CastOp::IntToFloat => Primitive::Int2Float,
                    CastOp::FloatToInt => Primitive::Float2Int,
                };
                self.asm.call_primitive(p);
                Ok(())
            }
            ExprKind::Call(callee, args) => {
                for arg in args {
                    self.expression(arg)?;
                }
                match callee {
                    Callee::Function(id) => self.asm.call_function(*id),
                    Callee::Primitive(p) => self.asm.call_primitive(*p),
                };
                Ok(())
            }
            ExprKind::Select(cond, then_e, else_e) => {
                self.expression(cond)?;
                let to_else = self.asm.emit_jump_if(0);
                self.expression(then_e)?;
                let to_end = self.asm.emit_jump();
                let here = self.asm.here();
                self.asm.back_patch_jump(to_else, here)?;
                self.expression(else_e)?;
                let here = self.asm.here();
                self.asm.back_patch_jump(to_end, here)
            }
            ExprKind::Element(agg, indices) => self.element(e, agg, indices),
            ExprKind::Field(agg, name) => {
                let s = agg.ty.word_size();
                let n = e.ty.word_size();
                let field = agg
                    .ty
                    .field_offset(name)
                    .ok_or_else(|| Error::internal(format!("no field {}", name)))?;
                self.expression(agg)?;
                self.asm
                    .emit(Opcode::Loada, Some(Register::ST), 0, -s + field);
                self.asm.emit(Opcode::Loadi, None, n, 0);
                self.asm.emit(Opcode::Pop, None, n, s);
                Ok(())
            }
            ExprKind::SubVector { source, start, len } => {
                self.sub_vector(source, start, *len as i32)
            }
            ExprKind::SubMatrix { source, row_start, rows, col_start, cols } => {
                self.sub_matrix(source, row_start, *rows as i32, col_start, *cols as i32)
            }
            ExprKind::MatMul(l, r) => {
                let (elem, lrows, dim) = match &l.ty {
                    Type::Matrix(t, r, c) => (t.as_ref().clone(), *r as i32, *c as i32),
                    _ => return Err(Error::internal("matmul of a non-matrix")),
                };
                let rcols = match &r.ty {
                    Type::Matrix(_, _, c) => *c as i32,
                    _ => return Err(Error::internal("matmul of a non-matrix")),
                };
                self.expression(l)?;
                self.expression(r)?;
                self.asm.emit_loadl(TypeTag::Int, lrows);
                self.asm.emit_loadl(TypeTag::Int, dim);
                self.asm.emit_loadl(TypeTag::Int, rcols);
                self.asm.call_primitive(mat_mul_primitive(&elem));
                Ok(())
            }
            // A dot product is a 1 x dim by dim x 1 matrix multiply.
            ExprKind::DotProduct(l, r) => {
                let (elem, dim) = match &l.ty {
                    Type::Vector(t, n) => (t.as_ref().clone(), *n as i32),
                    _ => return Err(Error::internal("dot product of a non-vector")),
                };
                self.expression(l)?;
                self.expression(r)?;
                self.asm.emit_loadl(TypeTag::Int, 1);
                self.asm.emit_loadl(TypeTag::Int, dim);
                self.asm.emit_loadl(TypeTag::Int, 1);
                self.asm.call_primitive(mat_mul_primitive(&elem));
                Ok(())
            }
            ExprKind::Transpose(operand) => {
                let (rows, cols) = match &operand.ty {
                    Type::Matrix(_, r, c) => (*r as i32, *c as i32),
                    _ => return Err(Error::internal("transpose of a non-matrix")),
                };
                self.expression(operand)?;
                self.asm.emit_loadl(TypeTag::Int, rows);
                self.asm.emit_loadl(TypeTag::Int, cols);
                self.asm.call_primitive(Primitive::MatTranspose);
                Ok(())
            }
        }
    }

    // Element selection as an rvalue: the aggregate is evaluated onto
    // the stack, the element address computed from its base, the
    // element loaded, and the aggregate popped from underneath.
    fn element(&mut self, e: &Expr, agg: &Expr, indices: &[Expr]) -> Result<()> {
        let s = agg.ty.word_size();
        let n = e.ty.word_size();
        let arity = match &agg.ty {
            Type::Vector(_, _) => 1,
            Type::Matrix(_, _, _) => 2,
            _ => 0,
        };
        if indices.len() != arity {
            return Err(Error::internal("wrong index count for element selection"));
        }
        self.expression(agg)?;
        self.asm.emit(Opcode::Loada, Some(Register::ST), 0, -s);
        match &agg.ty {
            Type::Vector(_, dim) => {
                self.expression(&indices[0])?;
                self.asm.emit_bounds_check(0, *dim as i32)?;
                self.asm.call_primitive(Primitive::AddI);
            }
            Type::Matrix(_, rows, cols) => {
                self.expression(&indices[0])?;
                self.asm.emit_bounds_check(0, *rows as i32)?;
                self.asm.emit_loadl(TypeTag::Int, *cols as i32);
                self.asm.call_primitive(Primitive::MulI);
                self.asm.call_primitive(Primitive::AddI);
                self.expression(&indices[1])?;
                self.asm.emit_bounds_check(0, *cols as i32)?;
                self.asm.call_primitive(Primitive::AddI);
            }
            _ => return Err(Error::internal("element selection on a scalar")),
        }
        self.asm.emit(Opcode::Loadi, None, n, 0);
        self.asm.emit(Opcode::Pop, None, n, s);
        Ok(())
    }

    // Stack: [src] -> [src dest] -> [src dest ptr] -> copy -> [dest].
    fn sub_vector(&mut self, source: &Expr, start: &Expr, len: i32) -> Result<()> {
        let (elem, dim) = match &source.ty {
            Type::Vector(t, n) => (t.as_ref().clone(), *n as i32),
            _ => return Err(Error::internal("sub-vector of a non-vector")),
        };
        let s = source.ty.word_size();
        self.expression(source)?;
        self.asm.emit_push(len, zero_tag(&elem));
        self.asm
            .emit(Opcode::Loada, Some(Register::ST), 0, -(len + s));
        self.expression(start)?;
        self.asm.emit_bounds_check(0, dim - len + 1)?;
        self.asm.call_primitive(Primitive::AddI);
        self.asm.emit(Opcode::Loadi, None, len, 0);
        self.asm
            .emit(Opcode::Loada, Some(Register::ST), 0, -(2 * len));
        self.asm.emit(Opcode::Storei, None, len, 0);
        self.asm.emit(Opcode::Pop, None, len, s);
        Ok(())
    }

    // Row-by-row copy out of the source matrix. The source start
    // pointer stays parked on the stack and is re-offset per row.
    fn sub_matrix(
        &mut self,
        source: &Expr,
        row_start: &Expr,
        sub_rows: i32,
        col_start: &Expr,
        sub_cols: i32,
    ) -> Result<()> {
        let (elem, rows, cols) = match &source.ty {
            Type::Matrix(t, r, c) => (t.as_ref().clone(), *r as i32, *c as i32),
            _ => return Err(Error::internal("sub-matrix of a non-matrix")),
        };
        let s = source.ty.word_size();
        let d = sub_rows * sub_cols;

        self.expression(source)?;
        self.asm.emit_push(d, zero_tag(&elem));
        self.asm.emit(Opcode::Loada, Some(Register::ST), 0, -(d + s));
        self.expression(row_start)?;
        self.asm.emit_bounds_check(0, rows - sub_rows + 1)?;
        self.asm.emit_loadl(TypeTag::Int, cols);
        self.asm.call_primitive(Primitive::MulI);
        self.asm.call_primitive(Primitive::AddI);
        self.expression(col_start)?;
        self.asm.emit_bounds_check(0, cols - sub_cols + 1)?;
        self.asm.call_primitive(Primitive::AddI);

        // stack: [src dest ptr]
        for r in 0..sub_rows {
            self.asm.emit(Opcode::Load, Some(Register::ST), 1, -1);
            if r > 0 {
                self.asm.emit_loadl(TypeTag::Int, r * cols);
                self.asm.call_primitive(Primitive::AddI);
            }
            self.asm.emit(Opcode::Loadi, None, sub_cols, 0);
            self.asm.emit(
                Opcode::Loada,
                Some(Register::ST),
                0,
                -(sub_cols + 1 + d) + r * sub_cols,
            );
            self.asm.emit(Opcode::Storei, None, sub_cols, 0);
        }
        self.asm.emit(Opcode::Pop, None, 0, 1);
        self.asm.emit(Opcode::Pop, None, d, s);
        Ok(())
    }

    fn binary(&mut self, op: BinOp, l: &Expr, r: &Expr) -> Result<()> {
        let ls = l.ty.word_size();
        let rs = r.ty.word_size();
        if ls == 1 && rs == 1 {
            self.expression(l)?;
            self.expression(r)?;
            self.asm.call_primitive(scalar_primitive(op, &l.ty));
            Ok(())
        } else {
            self.broadcast(op, l, r)
        }
    }

    // Element-wise arithmetic over equal-shaped structures and
    // struct/scalar pairs. The loop updates the structured operand in
    // place, addressing everything relative to ST, then pops the
    // leftovers so only the result remains.
    fn broadcast(&mut self, op: BinOp, l: &Expr, r: &Expr) -> Result<()> {
        let ls = l.ty.word_size();
        let rs = r.ty.word_size();
        let (shape, s, elem) = if ls > 1 && rs > 1 {
            (Shape::StructStruct, ls, element_type(&l.ty)?)
        } else if ls > 1 {
            (Shape::StructScalar, ls, element_type(&l.ty)?)
        } else {
            (Shape::ScalarStruct, rs, element_type(&r.ty)?)
        };
        let prim = scalar_primitive(op, &elem);

        self.expression(l)?;
        self.expression(r)?;
        self.asm.emit_push(1, TypeTag::Int); // index i = 0

        let to_cond = self.asm.emit_jump();
        let body = self.asm.here();
        match shape {
            // [L(s) R(s) i]: res = L[i] op R[i], stored into L[i]
            Shape::StructStruct => {
                self.asm
                    .emit(Opcode::Loada, Some(Register::ST), 0, -(2 * s + 1));
                self.asm.emit(Opcode::Load, Some(Register::ST), 1, -2);
                self.asm.call_primitive(Primitive::AddI);
                self.asm.emit(Opcode::Loadi, None, 1, 0);
                self.asm.emit(Opcode::Loada, Some(Register::ST), 0, -(s + 2));
                self.asm.emit(Opcode::Load, Some(Register::ST), 1, -3);
                self.asm.call_primitive(Primitive::AddI);
                self.asm.emit(Opcode::Loadi, None, 1, 0);
                self.asm.call_primitive(prim);
                self.asm
                    .emit(Opcode::Loada, Some(Register::ST), 0, -(2 * s + 2));
                self.asm.emit(Opcode::Load, Some(Register::ST), 1, -3);
                self.asm.call_primitive(Primitive::AddI);
                self.asm.emit(Opcode::Storei, None, 1, 0);
            }
            // [L(s) c i]: res = L[i] op c, stored into L[i]
            Shape::StructScalar => {
                self.asm.emit(Opcode::Loada, Some(Register::ST), 0, -(s + 2));
                self.asm.emit(Opcode::Load, Some(Register::ST), 1, -2);
                self.asm.call_primitive(Primitive::AddI);
                self.asm.emit(Opcode::Loadi, None, 1, 0);
                self.asm.emit(Opcode::Load, Some(Register::ST), 1, -3);
                self.asm.call_primitive(prim);
                self.asm.emit(Opcode::Loada, Some(Register::ST), 0, -(s + 3));
                self.asm.emit(Opcode::Load, Some(Register::ST), 1, -3);
                self.asm.call_primitive(Primitive::AddI);
                self.asm.emit(Opcode::Storei, None, 1, 0);
            }
            // [c R(s) i]: res = c op R[i], stored into R[i]
            Shape::ScalarStruct => {
                self.asm.emit(Opcode::Load, Some(Register::ST), 1, -(s + 2));
                self.asm.emit(Opcode::Loada, Some(Register::ST), 0, -(s + 2));
                self.asm.emit(Opcode::Load, Some(Register::ST), 1, -3);
                self.asm.call_primitive(Primitive::AddI);
                self.asm.emit(Opcode::Loadi, None, 1, 0);
                self.asm.call_primitive(prim);
                self.asm.emit(Opcode::Loada, Some(Register::ST), 0, -(s + 2));
                self.asm.emit(Opcode::Load, Some(Register::ST), 1, -3);
                self.asm.call_primitive(Primitive::AddI);
                self.asm.emit(Opcode::Storei, None, 1, 0);
            }
        }
        // i += 1
        self.asm.emit(Opcode::Load, Some(Register::ST), 1, -1);
        self.asm.call_primitive(Primitive::Succ);
        self.asm.emit(Opcode::Loada, Some(Register::ST), 0, -2);
        self.asm.emit(Opcode::Storei, None, 1, 0);
        // while i < s
        let here = self.asm.here();
        self.asm.back_patch_jump(to_cond, here)?;
        self.asm.emit(Opcode::Load, Some(Register::ST), 1, -1);
        self.asm.emit_loadl(TypeTag::Int, s);
        self.asm.call_primitive(Primitive::LtI);
        self.asm.emit_jump_if_to(1, body);

        match shape {
            Shape::StructStruct => {
                self.asm.emit(Opcode::Pop, None, 0, s + 1);
            }
            Shape::StructScalar => {
                self.asm.emit(Opcode::Pop, None, 0, 2);
            }
            Shape::ScalarStruct => {
                self.asm.emit(Opcode::Pop, None, 0, 1);
                self.asm.emit(Opcode::Pop, None, s, 1);
            }
        }
        Ok(())
    }
}

fn element_type(ty: &Type) -> Result<Type> {
    ty.element()
        .cloned()
        .ok_or_else(|| Error::internal("element-wise operation on a non-structure"))
}

fn mat_mul_primitive(elem: &Type) -> Primitive {
    match elem {
        Type::Float => Primitive::MatMulF,
        _ => Primitive::MatMulI,
    }
}


// These tests run compiled programs on the real VM and check the
// observable behavior: console output, final frame memory, and the
// latched error on failing runs.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FuncId, Node};
    use crate::error::{ErrorKind, SourceLocation};
    use crate::primitives::{format_matrix, MemoryConsole};
    use crate::value::Value;
    use crate::vm::{StopReason, Vm};

    fn loc() -> SourceLocation {
        SourceLocation::new(1, 1)
    }

    fn ex(kind: ExprKind, ty: Type) -> Expr {
        Expr { kind, ty, loc: loc() }
    }

    fn int(v: i32) -> Expr {
        ex(ExprKind::Int(v), Type::Int)
    }

    fn flt(v: f32) -> Expr {
        ex(ExprKind::Float(v), Type::Float)
    }

    fn var(d: usize, ty: Type) -> Expr {
        ex(ExprKind::Var(DeclId(d)), ty)
    }

    fn bin(op: BinOp, ty: Type, l: Expr, r: Expr) -> Expr {
        ex(ExprKind::Binary(op, Node::new(l), Node::new(r)), ty)
    }

    fn elem(agg: Expr, indices: Vec<Expr>, ty: Type) -> Expr {
        ex(ExprKind::Element(Node::new(agg), indices), ty)
    }

    fn st(kind: StmtKind) -> Stmt {
        Stmt { kind, loc: loc() }
    }

    fn call_prim(p: Primitive, args: Vec<Expr>, ty: Type) -> Expr {
        ex(ExprKind::Call(Callee::Primitive(p), args), ty)
    }

    fn print_int(e: Expr) -> Stmt {
        st(StmtKind::Expr(call_prim(Primitive::PrintInt, vec![e], Type::Void)))
    }

    fn print_line() -> Stmt {
        st(StmtKind::Expr(call_prim(Primitive::PrintLine, vec![], Type::Void)))
    }

    fn int_vector(n: usize) -> Type {
        Type::Vector(Node::new(Type::Int), n)
    }

    fn int_matrix(r: usize, c: usize) -> Type {
        Type::Matrix(Node::new(Type::Int), r, c)
    }

    fn main_fn(body: Vec<Stmt>) -> Function {
        Function {
            id: FuncId(0),
            name: String::from("main"),
            params: vec![],
            result: Type::Void,
            body,
            loc: loc(),
        }
    }

    fn program(functions: Vec<Function>) -> Program {
        Program { functions }
    }

    fn run(p: &Program) -> (crate::error::Result<StopReason>, Vm, String) {
        let image = compile(p).expect("compile failed");
        let mut vm = Vm::new(image);
        let mut console = MemoryConsole::new();
        let status = vm.run(&mut console);
        let output = String::from(console.output());
        (status, vm, output)
    }

    fn run_output(p: &Program) -> String {
        let (status, _, output) = run(p);
        assert_eq!(status, Ok(StopReason::Halted));
        output
    }

    // main's frame sits at the bottom of memory: header at 0 and 1,
    // locals from 2 up. Declarations stay put after HALT.
    fn frame_words(vm: &mut Vm, offset: i32, count: i32) -> Vec<Value> {
        (0..count)
            .map(|i| vm.machine_mut().get_mem(offset + i).unwrap())
            .collect()
    }

    // function void main() { printInt(1 + 2); printLine(); }
    #[test]
    fn test_scenario_print_sum() {
        let p = program(vec![main_fn(vec![
            print_int(bin(BinOp::Add, Type::Int, int(1), int(2))),
            print_line(),
        ])]);
        assert_eq!(run_output(&p), "3\n");
    }

    // function int fac(int n) { return n > 1 ? n * fac(n - 1) : 1; }
    // function void main()    { printInt(fac(5)); }
    // main comes first, so the call to fac is forward-patched.
    #[test]
    fn test_scenario_factorial() {
        let fac_id = FuncId(1);
        let n = 0;
        let fac_call = |arg: Expr| {
            ex(ExprKind::Call(Callee::Function(fac_id), vec![arg]), Type::Int)
        };
        let fac = Function {
            id: fac_id,
            name: String::from("fac"),
            params: vec![(DeclId(n), Type::Int)],
            result: Type::Int,
            body: vec![st(StmtKind::Return(Some(ex(
                ExprKind::Select(
                    Node::new(bin(BinOp::Gt, Type::Bool, var(n, Type::Int), int(1))),
                    Node::new(bin(
                        BinOp::Mul,
                        Type::Int,
                        var(n, Type::Int),
                        fac_call(bin(BinOp::Sub, Type::Int, var(n, Type::Int), int(1))),
                    )),
                    Node::new(int(1)),
                ),
                Type::Int,
            ))))],
            loc: loc(),
        };
        let main = main_fn(vec![print_int(fac_call(int(5)))]);
        assert_eq!(run_output(&program(vec![main, fac])), "120");
    }

    // var vector<int>[3] v; v[0]=1; v[1]=2; v[2]=3;
    // printInt(v[0] + v[1] + v[2]);
    #[test]
    fn test_scenario_vector_elements() {
        let v = 0;
        let vset = |i: i32, value: i32| {
            st(StmtKind::Assign {
                target: LValue::VectorElement(DeclId(v), int(i)),
                value: int(value),
            })
        };
        let vget = |i: i32| elem(var(v, int_vector(3)), vec![int(i)], Type::Int);
        let p = program(vec![main_fn(vec![
            st(StmtKind::Var { decl: DeclId(v), ty: int_vector(3) }),
            vset(0, 1),
            vset(1, 2),
            vset(2, 3),
            print_int(bin(
                BinOp::Add,
                Type::Int,
                bin(BinOp::Add, Type::Int, vget(0), vget(1)),
                vget(2),
            )),
        ])]);
        assert_eq!(run_output(&p), "6");
    }

    // var vector<int>[3] v; v[3] = 0;  => Runtime Error, bounds
    #[test]
    fn test_scenario_index_out_of_bounds() {
        let p = program(vec![main_fn(vec![
            st(StmtKind::Var { decl: DeclId(0), ty: int_vector(3) }),
            st(StmtKind::Assign {
                target: LValue::VectorElement(DeclId(0), int(3)),
                value: int(0),
            }),
        ])]);
        let (status, _, _) = run(&p);
        let e = status.unwrap_err();
        assert_eq!(e.kind, ErrorKind::RuntimeError);
        assert_eq!(e.message, "Index out of bounds");
    }

    // var int x; x = 10 / 0;  => Zero Division
    #[test]
    fn test_scenario_zero_division() {
        let p = program(vec![main_fn(vec![
            st(StmtKind::Var { decl: DeclId(0), ty: Type::Int }),
            st(StmtKind::Assign {
                target: LValue::Id(DeclId(0)),
                value: bin(BinOp::Div, Type::Int, int(10), int(0)),
            }),
        ])]);
        let (status, _, _) = run(&p);
        assert_eq!(status.unwrap_err().kind, ErrorKind::ZeroDivision);
    }

    // The 3x3 identity times itself is the identity; the product is
    // formatted exactly the way the matrix-write primitives print
    // rows.
    #[test]
    fn test_scenario_identity_mat_mul() {
        let m = 0;
        let mset = |r: i32, c: i32, value: i32| {
            st(StmtKind::Assign {
                target: LValue::MatrixElement(DeclId(m), int(r), int(c)),
                value: int(value),
            })
        };
        let p = program(vec![main_fn(vec![
            st(StmtKind::Var { decl: DeclId(m), ty: int_matrix(3, 3) }),
            mset(0, 0, 1),
            mset(1, 1, 1),
            mset(2, 2, 1),
            st(StmtKind::Val {
                decl: DeclId(1),
                ty: int_matrix(3, 3),
                init: ex(
                    ExprKind::MatMul(
                        Node::new(var(m, int_matrix(3, 3))),
                        Node::new(var(m, int_matrix(3, 3))),
                    ),
                    int_matrix(3, 3),
                ),
            }),
        ])]);
        let (status, mut vm, _) = run(&p);
        assert_eq!(status, Ok(StopReason::Halted));
        // m at 2[LB], the product at 11[LB]; main's frame base is 0
        let product = frame_words(&mut vm, 11, 9);
        let text = format_matrix(3, 3, &product, TypeTag::Int).unwrap();
        assert_eq!(text, "1, 0, 0\n0, 1, 0\n0, 0, 1\n");
    }

    #[test]
    fn test_if_else() {
        let build = |flag: bool| {
            program(vec![main_fn(vec![st(StmtKind::If {
                cond: ex(ExprKind::Bool(flag), Type::Bool),
                then_body: vec![print_int(int(1))],
                else_body: vec![print_int(int(2))],
            })])])
        };
        assert_eq!(run_output(&build(true)), "1");
        assert_eq!(run_output(&build(false)), "2");
    }

    // var int sum; for (int i = 0; i < 5; i = i + 1) sum = sum + i;
    #[test]
    fn test_for_loop() {
        let sum = 0;
        let i = 1;
        let p = program(vec![main_fn(vec![
            st(StmtKind::Var { decl: DeclId(sum), ty: Type::Int }),
            st(StmtKind::For {
                var: DeclId(i),
                ty: Type::Int,
                init: int(0),
                cond: bin(BinOp::Lt, Type::Bool, var(i, Type::Int), int(5)),
                step_var: DeclId(i),
                step: bin(BinOp::Add, Type::Int, var(i, Type::Int), int(1)),
                body: vec![st(StmtKind::Assign {
                    target: LValue::Id(DeclId(sum)),
                    value: bin(
                        BinOp::Add,
                        Type::Int,
                        var(sum, Type::Int),
                        var(i, Type::Int),
                    ),
                })],
            }),
            print_int(var(sum, Type::Int)),
        ])]);
        assert_eq!(run_output(&p), "10");
    }

    // A zero-trip for loop runs the body not at all.
    #[test]
    fn test_for_loop_zero_trips() {
        let i = 0;
        let p = program(vec![main_fn(vec![
            st(StmtKind::For {
                var: DeclId(i),
                ty: Type::Int,
                init: int(9),
                cond: bin(BinOp::Lt, Type::Bool, var(i, Type::Int), int(5)),
                step_var: DeclId(i),
                step: bin(BinOp::Add, Type::Int, var(i, Type::Int), int(1)),
                body: vec![print_int(int(7))],
            }),
            print_int(int(0)),
        ])]);
        assert_eq!(run_output(&p), "0");
    }

    // foreach with a var iterator doubles the source in place.
    #[test]
    fn test_foreach_mutable() {
        let v = 0;
        let it = 1;
        let vset = |i: i32, value: i32| {
            st(StmtKind::Assign {
                target: LValue::VectorElement(DeclId(v), int(i)),
                value: int(value),
            })
        };
        let vget = |i: i32| elem(var(v, int_vector(3)), vec![int(i)], Type::Int);
        let p = program(vec![main_fn(vec![
            st(StmtKind::Var { decl: DeclId(v), ty: int_vector(3) }),
            vset(0, 1),
            vset(1, 2),
            vset(2, 3),
            st(StmtKind::ForEach {
                iter: DeclId(it),
                ty: Type::Int,
                mutable: true,
                source: DeclId(v),
                body: vec![st(StmtKind::Assign {
                    target: LValue::Id(DeclId(it)),
                    value: bin(BinOp::Mul, Type::Int, var(it, Type::Int), int(2)),
                })],
            }),
            print_int(bin(
                BinOp::Add,
                Type::Int,
                bin(BinOp::Add, Type::Int, vget(0), vget(1)),
                vget(2),
            )),
        ])]);
        assert_eq!(run_output(&p), "12");
    }

    // A val iterator observes but never writes back.
    #[test]
    fn test_foreach_readonly() {
        let v = 0;
        let it = 1;
        let acc = 2;
        let p = program(vec![main_fn(vec![
            st(StmtKind::Var { decl: DeclId(v), ty: int_vector(2) }),
            st(StmtKind::Assign {
                target: LValue::VectorElement(DeclId(v), int(0)),
                value: int(4),
            }),
            st(StmtKind::Assign {
                target: LValue::VectorElement(DeclId(v), int(1)),
                value: int(5),
            }),
            st(StmtKind::Var { decl: DeclId(acc), ty: Type::Int }),
            st(StmtKind::ForEach {
                iter: DeclId(it),
                ty: Type::Int,
                mutable: false,
                source: DeclId(v),
                body: vec![st(StmtKind::Assign {
                    target: LValue::Id(DeclId(acc)),
                    value: bin(
                        BinOp::Add,
                        Type::Int,
                        var(acc, Type::Int),
                        var(it, Type::Int),
                    ),
                })],
            }),
            print_int(var(acc, Type::Int)),
            print_int(elem(var(v, int_vector(2)), vec![int(0)], Type::Int)),
        ])]);
        assert_eq!(run_output(&p), "94");
    }

    #[test]
    fn test_switch() {
        let build = |disc: i32| {
            program(vec![main_fn(vec![st(StmtKind::Switch {
                disc: int(disc),
                cases: vec![
                    (1, vec![print_int(int(10))]),
                    (2, vec![print_int(int(20))]),
                ],
                default: Some(vec![print_int(int(99))]),
            })])])
        };
        assert_eq!(run_output(&build(1)), "10");
        assert_eq!(run_output(&build(2)), "20");
        assert_eq!(run_output(&build(7)), "99");
    }

    #[test]
    fn test_switch_without_default() {
        let p = program(vec![main_fn(vec![
            st(StmtKind::Switch {
                disc: int(5),
                cases: vec![(1, vec![print_int(int(10))])],
                default: None,
            }),
            print_int(int(0)),
        ])]);
        assert_eq!(run_output(&p), "0");
    }

    // function int add2(int a, int b) { return a + b; }
    #[test]
    fn test_two_parameters() {
        let add2_id = FuncId(1);
        let (a, b) = (0, 1);
        let add2 = Function {
            id: add2_id,
            name: String::from("add2"),
            params: vec![(DeclId(a), Type::Int), (DeclId(b), Type::Int)],
            result: Type::Int,
            body: vec![st(StmtKind::Return(Some(bin(
                BinOp::Sub,
                Type::Int,
                var(a, Type::Int),
                var(b, Type::Int),
            ))))],
            loc: loc(),
        };
        let main = main_fn(vec![print_int(ex(
            ExprKind::Call(Callee::Function(add2_id), vec![int(10), int(4)]),
            Type::Int,
        ))]);
        // a - b distinguishes the parameter order
        assert_eq!(run_output(&program(vec![main, add2])), "6");
    }

    // A function returning an aggregate: the words come back on the
    // stack and element selection works on the call result.
    #[test]
    fn test_aggregate_return() {
        let make_id = FuncId(1);
        let v = 0;
        let make = Function {
            id: make_id,
            name: String::from("make"),
            params: vec![],
            result: int_vector(2),
            body: vec![
                st(StmtKind::Var { decl: DeclId(v), ty: int_vector(2) }),
                st(StmtKind::Assign {
                    target: LValue::VectorElement(DeclId(v), int(0)),
                    value: int(30),
                }),
                st(StmtKind::Assign {
                    target: LValue::VectorElement(DeclId(v), int(1)),
                    value: int(12),
                }),
                st(StmtKind::Return(Some(var(v, int_vector(2))))),
            ],
            loc: loc(),
        };
        let call = ex(
            ExprKind::Call(Callee::Function(make_id), vec![]),
            int_vector(2),
        );
        let main = main_fn(vec![print_int(elem(call, vec![int(1)], Type::Int))]);
        assert_eq!(run_output(&program(vec![main, make])), "12");
    }

    #[test]
    fn test_record_fields() {
        let rec = Type::Record(
            String::from("pair"),
            vec![
                (String::from("a"), Type::Int),
                (String::from("v"), int_vector(2)),
            ],
        );
        let r = 0;
        let w = 1;
        let p = program(vec![main_fn(vec![
            st(StmtKind::Var { decl: DeclId(w), ty: int_vector(2) }),
            st(StmtKind::Assign {
                target: LValue::VectorElement(DeclId(w), int(0)),
                value: int(7),
            }),
            st(StmtKind::Assign {
                target: LValue::VectorElement(DeclId(w), int(1)),
                value: int(8),
            }),
            st(StmtKind::Var { decl: DeclId(r), ty: rec.clone() }),
            st(StmtKind::Assign {
                target: LValue::Field(DeclId(r), String::from("a")),
                value: int(5),
            }),
            st(StmtKind::Assign {
                target: LValue::Field(DeclId(r), String::from("v")),
                value: var(w, int_vector(2)),
            }),
            print_int(ex(
                ExprKind::Field(Node::new(var(r, rec.clone())), String::from("a")),
                Type::Int,
            )),
            print_int(elem(
                ex(
                    ExprKind::Field(Node::new(var(r, rec.clone())), String::from("v")),
                    int_vector(2),
                ),
                vec![int(1)],
                Type::Int,
            )),
        ])]);
        assert_eq!(run_output(&p), "58");
    }

    #[test]
    fn test_sub_vector() {
        let v = 0;
        let s = 1;
        let vset = |i: i32, value: i32| {
            st(StmtKind::Assign {
                target: LValue::VectorElement(DeclId(v), int(i)),
                value: int(value),
            })
        };
        let p = program(vec![main_fn(vec![
            st(StmtKind::Var { decl: DeclId(v), ty: int_vector(4) }),
            vset(0, 1),
            vset(1, 2),
            vset(2, 3),
            vset(3, 4),
            st(StmtKind::Val {
                decl: DeclId(s),
                ty: int_vector(2),
                init: ex(
                    ExprKind::SubVector {
                        source: Node::new(var(v, int_vector(4))),
                        start: Node::new(int(1)),
                        len: 2,
                    },
                    int_vector(2),
                ),
            }),
            print_int(bin(
                BinOp::Add,
                Type::Int,
                elem(var(s, int_vector(2)), vec![int(0)], Type::Int),
                elem(var(s, int_vector(2)), vec![int(1)], Type::Int),
            )),
        ])]);
        assert_eq!(run_output(&p), "5");
    }

    #[test]
    fn test_sub_vector_bounds() {
        let p = program(vec![main_fn(vec![
            st(StmtKind::Var { decl: DeclId(0), ty: int_vector(4) }),
            st(StmtKind::Val {
                decl: DeclId(1),
                ty: int_vector(2),
                init: ex(
                    ExprKind::SubVector {
                        source: Node::new(var(0, int_vector(4))),
                        start: Node::new(int(3)), // 3 + 2 > 4
                        len: 2,
                    },
                    int_vector(2),
                ),
            }),
        ])]);
        let (status, _, _) = run(&p);
        assert_eq!(status.unwrap_err().message, "Index out of bounds");
    }

    #[test]
    fn test_sub_matrix() {
        let m = 0;
        let s = 1;
        let mut body = vec![st(StmtKind::Var { decl: DeclId(m), ty: int_matrix(3, 3) })];
        // fill 1..9 row-major
        for r in 0..3 {
            for c in 0..3 {
                body.push(st(StmtKind::Assign {
                    target: LValue::MatrixElement(DeclId(m), int(r), int(c)),
                    value: int(r * 3 + c + 1),
                }));
            }
        }
        body.push(st(StmtKind::Val {
            decl: DeclId(s),
            ty: int_matrix(2, 2),
            init: ex(
                ExprKind::SubMatrix {
                    source: Node::new(var(m, int_matrix(3, 3))),
                    row_start: Node::new(int(1)),
                    rows: 2,
                    col_start: Node::new(int(1)),
                    cols: 2,
                },
                int_matrix(2, 2),
            ),
        }));
        let p = program(vec![main_fn(body)]);
        let (status, mut vm, _) = run(&p);
        assert_eq!(status, Ok(StopReason::Halted));
        // m occupies 2..11, the sub-matrix 11..15: [5 6; 8 9]
        assert_eq!(
            frame_words(&mut vm, 11, 4),
            vec![Value::Int(5), Value::Int(6), Value::Int(8), Value::Int(9)]
        );
    }

    fn filled_vector(decl: usize, values: &[i32]) -> Vec<Stmt> {
        let mut stmts = vec![st(StmtKind::Var {
            decl: DeclId(decl),
            ty: int_vector(values.len()),
        })];
        for (i, v) in values.iter().enumerate() {
            stmts.push(st(StmtKind::Assign {
                target: LValue::VectorElement(DeclId(decl), int(i as i32)),
                value: int(*v),
            }));
        }
        stmts
    }

    #[test]
    fn test_broadcast_struct_struct() {
        let mut body = filled_vector(0, &[1, 2, 3]);
        body.push(st(StmtKind::Val {
            decl: DeclId(1),
            ty: int_vector(3),
            init: bin(
                BinOp::Add,
                int_vector(3),
                var(0, int_vector(3)),
                var(0, int_vector(3)),
            ),
        }));
        let p = program(vec![main_fn(body)]);
        let (status, mut vm, _) = run(&p);
        assert_eq!(status, Ok(StopReason::Halted));
        // source at 2..5 untouched, result at 5..8
        assert_eq!(
            frame_words(&mut vm, 2, 6),
            vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(3),
                Value::Int(2),
                Value::Int(4),
                Value::Int(6),
            ]
        );
    }

    #[test]
    fn test_broadcast_struct_scalar() {
        let mut body = filled_vector(0, &[1, 2, 3]);
        body.push(st(StmtKind::Val {
            decl: DeclId(1),
            ty: int_vector(3),
            init: bin(
                BinOp::Mul,
                int_vector(3),
                var(0, int_vector(3)),
                int(10),
            ),
        }));
        let p = program(vec![main_fn(body)]);
        let (status, mut vm, _) = run(&p);
        assert_eq!(status, Ok(StopReason::Halted));
        assert_eq!(
            frame_words(&mut vm, 5, 3),
            vec![Value::Int(10), Value::Int(20), Value::Int(30)]
        );
    }

    // Subtraction makes the operand order observable.
    #[test]
    fn test_broadcast_scalar_struct() {
        let mut body = filled_vector(0, &[1, 2, 3]);
        body.push(st(StmtKind::Val {
            decl: DeclId(1),
            ty: int_vector(3),
            init: bin(
                BinOp::Sub,
                int_vector(3),
                int(10),
                var(0, int_vector(3)),
            ),
        }));
        let p = program(vec![main_fn(body)]);
        let (status, mut vm, _) = run(&p);
        assert_eq!(status, Ok(StopReason::Halted));
        assert_eq!(
            frame_words(&mut vm, 5, 3),
            vec![Value::Int(9), Value::Int(8), Value::Int(7)]
        );
    }

    #[test]
    fn test_dot_product() {
        let mut body = filled_vector(0, &[1, 2, 3]);
        body.extend(filled_vector(1, &[4, 5, 6]));
        body.push(print_int(ex(
            ExprKind::DotProduct(
                Node::new(var(0, int_vector(3))),
                Node::new(var(1, int_vector(3))),
            ),
            Type::Int,
        )));
        assert_eq!(run_output(&program(vec![main_fn(body)])), "32");
    }

    #[test]
    fn test_transpose() {
        let m = 0;
        let mut body = vec![st(StmtKind::Var { decl: DeclId(m), ty: int_matrix(2, 3) })];
        for r in 0..2 {
            for c in 0..3 {
                body.push(st(StmtKind::Assign {
                    target: LValue::MatrixElement(DeclId(m), int(r), int(c)),
                    value: int(r * 3 + c + 1),
                }));
            }
        }
        // t[0][1] of the 3x2 transpose is m[1][0] = 4
        body.push(print_int(elem(
            ex(
                ExprKind::Transpose(Node::new(var(m, int_matrix(2, 3)))),
                int_matrix(3, 2),
            ),
            vec![int(0), int(1)],
            Type::Int,
        )));
        assert_eq!(run_output(&program(vec![main_fn(body)])), "4");
    }

    #[test]
    fn test_float_arithmetic_and_casts() {
        let p = program(vec![main_fn(vec![
            st(StmtKind::Expr(call_prim(
                Primitive::PrintFloat,
                vec![bin(BinOp::Add, Type::Float, flt(1.25), flt(2.25))],
                Type::Void,
            ))),
            print_line(),
            print_int(ex(
                ExprKind::Cast(CastOp::FloatToInt, Node::new(flt(3.9))),
                Type::Int,
            )),
            print_line(),
            st(StmtKind::Expr(call_prim(
                Primitive::PrintFloat,
                vec![ex(
                    ExprKind::Cast(CastOp::IntToFloat, Node::new(int(2))),
                    Type::Float,
                )],
                Type::Void,
            ))),
        ])]);
        assert_eq!(run_output(&p), "3.5\n3\n2.0");
    }

    #[test]
    fn test_string_literals_share_pool_entries() {
        let hello = ex(ExprKind::Str(String::from("hi")), Type::Str);
        let p = program(vec![main_fn(vec![
            st(StmtKind::Expr(call_prim(
                Primitive::PrintString,
                vec![hello.clone()],
                Type::Void,
            ))),
            st(StmtKind::Expr(call_prim(
                Primitive::PrintString,
                vec![hello],
                Type::Void,
            ))),
        ])]);
        let image = compile(&p).unwrap();
        // "hi" interned once, plus the bounds message never emitted
        assert_eq!(image.string_count(), 1);
        let mut vm = Vm::new(image);
        let mut console = MemoryConsole::new();
        assert_eq!(vm.run(&mut console), Ok(StopReason::Halted));
        assert_eq!(console.output(), "hihi");
    }

    #[test]
    fn test_unary_and_logic() {
        let p = program(vec![main_fn(vec![
            print_int(ex(
                ExprKind::Unary(UnOp::Neg, Node::new(int(5))),
                Type::Int,
            )),
            st(StmtKind::If {
                cond: ex(
                    ExprKind::Unary(
                        UnOp::Not,
                        Node::new(ex(ExprKind::Bool(false), Type::Bool)),
                    ),
                    Type::Bool,
                ),
                then_body: vec![print_int(int(1))],
                else_body: vec![],
            }),
            st(StmtKind::If {
                cond: bin(
                    BinOp::And,
                    Type::Bool,
                    ex(ExprKind::Bool(true), Type::Bool),
                    ex(ExprKind::Bool(false), Type::Bool),
                ),
                then_body: vec![print_int(int(8))],
                else_body: vec![print_int(int(9))],
            }),
        ])]);
        assert_eq!(run_output(&p), "-519");
    }

    // Nested blocks reclaim their locals: the inner val's slot is
    // reused afterwards without disturbing the outer frame.
    #[test]
    fn test_block_scoping_reclaims_slots() {
        let outer = 0;
        let inner = 1;
        let p = program(vec![main_fn(vec![
            st(StmtKind::Val { decl: DeclId(outer), ty: Type::Int, init: int(1) }),
            st(StmtKind::Block(vec![
                st(StmtKind::Val { decl: DeclId(inner), ty: Type::Int, init: int(40) }),
                print_int(bin(
                    BinOp::Add,
                    Type::Int,
                    var(outer, Type::Int),
                    var(inner, Type::Int),
                )),
            ])),
            print_int(var(outer, Type::Int)),
        ])]);
        assert_eq!(run_output(&p), "411");
    }

    // Compiled images survive a save/load round trip and still run.
    #[test]
    fn test_compiled_image_round_trip() {
        let p = program(vec![main_fn(vec![
            print_int(bin(BinOp::Add, Type::Int, int(20), int(22))),
        ])]);
        let image = compile(&p).unwrap();
        let mut buf = Vec::new();
        image.save(&mut buf).unwrap();
        let mut loaded = Image::load(&mut std::io::Cursor::new(&buf)).unwrap();
        // symbols travel separately
        let mut sym = Vec::new();
        image.save_symbols(&mut sym).unwrap();
        loaded.load_symbols(&mut std::io::Cursor::new(&sym)).unwrap();

        let mut vm = Vm::new(loaded);
        let mut console = MemoryConsole::new();
        assert_eq!(vm.run(&mut console), Ok(StopReason::Halted));
        assert_eq!(console.output(), "42");
    }

    // Without the symbol sidecar the literals lose their type tags
    // and run as Unknown words: the wildcard rule keeps the program
    // behavior identical.
    #[test]
    fn test_stripped_image_still_runs() {
        let p = program(vec![main_fn(vec![
            print_int(bin(BinOp::Add, Type::Int, int(20), int(22))),
        ])]);
        let image = compile(&p).unwrap();
        let mut buf = Vec::new();
        image.save(&mut buf).unwrap();
        let stripped = Image::load(&mut std::io::Cursor::new(&buf)).unwrap();

        let mut vm = Vm::new(stripped);
        let mut console = MemoryConsole::new();
        assert_eq!(vm.run(&mut console), Ok(StopReason::Halted));
        assert_eq!(console.output(), "42");
    }
}
