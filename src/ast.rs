// The typed AST handed over by the analysis stage.
//
// Every declaration site carries a dense DeclId and every function a
// dense FuncId, resolved by the external scope checker. Every
// expression node is annotated with its result type and a source
// location; no implicit conversions remain. The code generator walks
// these tagged variants with plain pattern matching.

use std::rc::Rc;

use crate::error::SourceLocation;


// Abstract over various memory management strategies.
pub type Node<T> = Rc<T>;
pub type Seq<T> = Vec<T>;


#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeclId(pub usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FuncId(pub usize);


// ADT for types. Word sizes are fixed: primitives take one word,
// aggregates the sum of their parts.
#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    Void,
    Int,
    Bool,
    Float,
    Str,
    Vector(Node<Type>, usize),
    Matrix(Node<Type>, usize, usize),
    Record(String, Seq<(String, Type)>),
}

impl Type {
    pub fn word_size(&self) -> i32 {
        match self {
            Type::Void => 0,
            Type::Int | Type::Bool | Type::Float | Type::Str => 1,
            Type::Vector(_, n) => *n as i32,
            Type::Matrix(_, r, c) => (r * c) as i32,
            Type::Record(_, fields) => {
                fields.iter().map(|(_, t)| t.word_size()).sum()
            }
        }
    }

    // The element type of a vector or matrix.
    pub fn element(&self) -> Option<&Type> {
        match self {
            Type::Vector(t, _) => Some(t),
            Type::Matrix(t, _, _) => Some(t),
            _ => None,
        }
    }

    // Word offset of a record field: the sum of the sizes of the
    // fields preceding it.
    pub fn field_offset(&self, name: &str) -> Option<i32> {
        if let Type::Record(_, fields) = self {
            let mut offset = 0;
            for (field, t) in fields {
                if field == name {
                    return Some(offset);
                }
                offset += t.word_size();
            }
        }
        None
    }

    pub fn field_type(&self, name: &str) -> Option<&Type> {
        if let Type::Record(_, fields) = self {
            fields.iter().find(|(f, _)| f == name).map(|(_, t)| t)
        } else {
            None
        }
    }
}


// Arithmetic, logic and relational operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CastOp {
    IntToFloat,
    FloatToInt,
}


// A call target: either a user function or one of the VM primitives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Callee {
    Function(FuncId),
    Primitive(crate::primitives::Primitive),
}


#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Type,
    pub loc: SourceLocation,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Int(i32),
    Bool(bool),
    Float(f32),
    Str(String),
    Var(DeclId),
    Unary(UnOp, Node<Expr>),
    Binary(BinOp, Node<Expr>, Node<Expr>),
    Cast(CastOp, Node<Expr>),
    Call(Callee, Seq<Expr>),
    // cond ? then : else
    Select(Node<Expr>, Node<Expr>, Node<Expr>),
    // v[i] or m[r][c]
    Element(Node<Expr>, Seq<Expr>),
    Field(Node<Expr>, String),
    // v[start : start+len), len fixed at compile time
    SubVector {
        source: Node<Expr>,
        start: Node<Expr>,
        len: usize,
    },
    SubMatrix {
        source: Node<Expr>,
        row_start: Node<Expr>,
        rows: usize,
        col_start: Node<Expr>,
        cols: usize,
    },
    MatMul(Node<Expr>, Node<Expr>),
    DotProduct(Node<Expr>, Node<Expr>),
    Transpose(Node<Expr>),
}


// Assignment targets: the four addressable shapes.
#[derive(Clone, Debug, PartialEq)]
pub enum LValue {
    Id(DeclId),
    VectorElement(DeclId, Expr),
    MatrixElement(DeclId, Expr, Expr),
    Field(DeclId, String),
}


#[derive(Clone, Debug, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub loc: SourceLocation,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StmtKind {
    // val x = init;
    Val {
        decl: DeclId,
        ty: Type,
        init: Expr,
    },
    // var x;
    Var {
        decl: DeclId,
        ty: Type,
    },
    Assign {
        target: LValue,
        value: Expr,
    },
    Expr(Expr),
    Block(Seq<Stmt>),
    If {
        cond: Expr,
        then_body: Seq<Stmt>,
        else_body: Seq<Stmt>,
    },
    // for (var = init; cond; step_var = step)
    For {
        var: DeclId,
        ty: Type,
        init: Expr,
        cond: Expr,
        step_var: DeclId,
        step: Expr,
        body: Seq<Stmt>,
    },
    // foreach (iter : source) over the words of a structured value
    ForEach {
        iter: DeclId,
        ty: Type,
        mutable: bool,
        source: DeclId,
        body: Seq<Stmt>,
    },
    Switch {
        disc: Expr,
        cases: Seq<(i32, Seq<Stmt>)>,
        default: Option<Seq<Stmt>>,
    },
    Return(Option<Expr>),
}


#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub id: FuncId,
    pub name: String,
    pub params: Seq<(DeclId, Type)>,
    pub result: Type,
    pub body: Seq<Stmt>,
    pub loc: SourceLocation,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    pub functions: Seq<Function>,
}
