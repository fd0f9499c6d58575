//! Textual parser for the LLVM-flavored IR syntax.
//!
//! Tests and fixtures write modules as text; the code generator itself only
//! ever sees the resolved [`Module`]. Two passes: parse text into an
//! untyped AST with chumsky, then resolve names, types and block labels
//! into the arena-backed model.
//!
//! The grammar covers the legalized subset the generator accepts, not all
//! of LLVM: scalar and 4-lane vector types, the constant forms that survive
//! upstream normalization, and one instruction per line.

use std::collections::HashMap;

use chumsky::prelude::*;

use crate::ir::{
    BinOp, CastOp, Callee, Const, ConstExpr, ConstId, FPred, FuncId, IPred, InstKind, Module,
    ModuleBuilder, RmwOp, Ty, TyId, TypeStore, Value, VecKind,
};

// ─── AST types (first pass) ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum AstTy {
    Void,
    Int(u32),
    Float,
    Double,
    Ptr(Box<AstTy>),
    Vec(u32, Box<AstTy>),
    Array(u32, Box<AstTy>),
    Struct(Vec<AstTy>, bool),
    Func(Box<AstTy>, Vec<AstTy>),
}

#[derive(Debug, Clone)]
enum AstConst {
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    Undef,
    Zero,
    Str(Vec<u8>),
    Struct(Vec<AstTyped>, bool),
    Array(Vec<AstTyped>),
    Vector(Vec<AstTyped>),
    GlobalRef(String),
    Bitcast(Box<AstTyped>, AstTy),
    PtrToInt(Box<AstTyped>, AstTy),
    IntToPtr(Box<AstTyped>, AstTy),
    Add(AstTy, Box<AstTyped>, Box<AstTyped>),
    Gep {
        source: AstTy,
        base: Box<AstTyped>,
        indices: Vec<AstTyped>,
    },
}

/// A `ty const` pair as written in aggregate and expression positions.
#[derive(Debug, Clone)]
struct AstTyped {
    ty: AstTy,
    c: AstConst,
}

/// An operand: a local reference or an inline constant.
#[derive(Debug, Clone)]
enum AstVal {
    Local(String),
    Const(AstConst),
}

/// A `ty val` operand pair.
#[derive(Debug, Clone)]
struct Tv {
    ty: AstTy,
    v: AstVal,
}

#[derive(Debug, Clone)]
struct AstInst {
    name: Option<String>,
    op: AstOp,
}

#[derive(Debug, Clone)]
enum AstOp {
    Bin {
        op: BinOp,
        ty: AstTy,
        a: AstVal,
        b: AstVal,
    },
    ICmp {
        pred: IPred,
        ty: AstTy,
        a: AstVal,
        b: AstVal,
    },
    FCmp {
        pred: FPred,
        ty: AstTy,
        a: AstVal,
        b: AstVal,
    },
    Load {
        ty: AstTy,
        ptr: Tv,
        align: u32,
    },
    Store {
        val: Tv,
        ptr: Tv,
        align: u32,
    },
    Gep {
        base: Tv,
        indices: Vec<Tv>,
    },
    Cast {
        op: CastOp,
        val: Tv,
        to: AstTy,
    },
    Alloca {
        ty: AstTy,
        count: Option<Tv>,
        align: u32,
    },
    Select {
        cond: Tv,
        a: Tv,
        b: Tv,
    },
    Phi {
        ty: AstTy,
        incoming: Vec<(AstVal, String)>,
    },
    Call {
        ret: AstTy,
        callee: AstVal,
        args: Vec<Tv>,
    },
    AtomicRmw {
        op: RmwOp,
        ptr: Tv,
        val: Tv,
    },
    Fence,
    ExtractElement {
        vec: Tv,
        lane: Tv,
    },
    InsertElement {
        vec: Tv,
        elt: Tv,
        lane: Tv,
    },
    Shuffle {
        a: Tv,
        b: Tv,
        mask: AstTyped,
    },
    Ret(Option<Tv>),
    Br(String),
    CondBr(AstVal, String, String),
    Switch {
        cond: Tv,
        default: String,
        cases: Vec<(i64, String)>,
    },
    IndirectBr {
        addr: Tv,
        dests: Vec<String>,
    },
    Unreachable,
}

#[derive(Debug, Clone)]
enum AstBodyItem {
    Label(String),
    Inst(AstInst),
}

#[derive(Debug, Clone)]
enum AstItem {
    Triple(String),
    Global {
        name: String,
        keywords: Vec<String>,
        ty: AstTy,
        init: Option<AstConst>,
        align: u32,
    },
    Declare {
        name: String,
        ret: AstTy,
        params: Vec<AstTy>,
    },
    Define {
        name: String,
        ret: AstTy,
        params: Vec<(AstTy, String)>,
        attrs: Vec<String>,
        body: Vec<AstBodyItem>,
    },
}

// ─── Parsers ────────────────────────────────────────────────────────────────

type Extra<'src> = extra::Err<Rich<'src, char>>;

fn ws<'src>() -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    choice((
        any().filter(|c: &char| c.is_whitespace()).ignored(),
        just(";")
            .then(any().filter(|c: &char| *c != '\n').repeated())
            .ignored(),
    ))
    .repeated()
    .ignored()
}

fn tok<'src>(s: &'static str) -> impl Parser<'src, &'src str, &'src str, Extra<'src>> + Clone {
    just(s).padded_by(ws())
}

/// An identifier as allowed after `@` and `%` and for labels.
fn ident<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_alphanumeric() || matches!(c, '_' | '.' | '$' | '-'))
        .repeated()
        .at_least(1)
        .to_slice()
        .map(|s: &str| s.to_string())
}

fn uint<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> + Clone {
    text::int::<_, Extra<'_>>(10).map(|s: &str| s.parse::<u32>().unwrap())
}

fn int64<'src>() -> impl Parser<'src, &'src str, i64, Extra<'src>> + Clone {
    just("-")
        .or_not()
        .then(text::int::<_, Extra<'_>>(10))
        .map(|(neg, s): (Option<&str>, &str)| {
            let v = s.parse::<u64>().unwrap() as i64;
            if neg.is_some() {
                v.wrapping_neg()
            } else {
                v
            }
        })
}

/// Float literal: decimal with a dot and optional exponent, or the
/// bit-exact `0x...` form LLVM prints for doubles.
fn float64<'src>() -> impl Parser<'src, &'src str, f64, Extra<'src>> + Clone {
    let hex = just("0x")
        .ignore_then(
            any()
                .filter(|c: &char| c.is_ascii_hexdigit())
                .repeated()
                .at_least(1)
                .to_slice(),
        )
        .map(|s: &str| f64::from_bits(u64::from_str_radix(s, 16).unwrap()));
    let dec = just("-")
        .or_not()
        .then(text::int::<_, Extra<'_>>(10))
        .then(just(".").then(text::int::<_, Extra<'_>>(10)))
        .then(
            just("e")
                .or(just("E"))
                .then(just("-").or(just("+")).or_not())
                .then(text::int::<_, Extra<'_>>(10))
                .or_not(),
        )
        .to_slice()
        .map(|s: &str| s.parse::<f64>().unwrap());
    hex.or(dec)
}

/// A `c"..."` byte string with `\xx` hex escapes.
fn cstring<'src>() -> impl Parser<'src, &'src str, Vec<u8>, Extra<'src>> + Clone {
    let escape = just("\\").ignore_then(
        any()
            .filter(|c: &char| c.is_ascii_hexdigit())
            .repeated()
            .exactly(2)
            .to_slice()
            .map(|s: &str| u8::from_str_radix(s, 16).unwrap()),
    );
    let plain = any()
        .filter(|c: &char| *c != '"' && *c != '\\')
        .map(|c: char| c as u8);
    just("c\"")
        .ignore_then(escape.or(plain).repeated().collect::<Vec<u8>>())
        .then_ignore(just("\""))
}

fn ty<'src>() -> impl Parser<'src, &'src str, AstTy, Extra<'src>> + Clone {
    recursive(|ty| {
        let int = just("i").ignore_then(uint()).map(AstTy::Int);
        let vec = tok("<")
            .ignore_then(uint())
            .then_ignore(tok("x"))
            .then(ty.clone())
            .then_ignore(tok(">"))
            .map(|(n, elem)| AstTy::Vec(n, Box::new(elem)));
        let array = tok("[")
            .ignore_then(uint())
            .then_ignore(tok("x"))
            .then(ty.clone())
            .then_ignore(tok("]"))
            .map(|(n, elem)| AstTy::Array(n, Box::new(elem)));
        let packed = just("<{")
            .padded_by(ws())
            .ignore_then(
                ty.clone()
                    .separated_by(tok(","))
                    .collect::<Vec<_>>(),
            )
            .then_ignore(tok("}>"))
            .map(|fields| AstTy::Struct(fields, true));
        let plain_struct = tok("{")
            .ignore_then(
                ty.clone()
                    .separated_by(tok(","))
                    .collect::<Vec<_>>(),
            )
            .then_ignore(tok("}"))
            .map(|fields| AstTy::Struct(fields, false));

        let base = choice((
            just("void").to(AstTy::Void),
            just("double").to(AstTy::Double),
            just("float").to(AstTy::Float),
            int,
            vec,
            array,
            packed,
            plain_struct,
        ));

        // A parenthesized parameter list makes a function type; trailing
        // stars make pointers.
        base.then(
            tok("(")
                .ignore_then(
                    ty.clone()
                        .separated_by(tok(","))
                        .collect::<Vec<_>>(),
                )
                .then_ignore(tok(")"))
                .or_not(),
        )
        .then(just("*").padded_by(ws()).repeated().collect::<Vec<_>>())
        .map(|((base, params), stars)| {
            let mut t = match params {
                Some(params) => AstTy::Func(Box::new(base), params),
                None => base,
            };
            for _ in 0..stars.len() {
                t = AstTy::Ptr(Box::new(t));
            }
            t
        })
    })
}

fn constant<'src>() -> impl Parser<'src, &'src str, AstConst, Extra<'src>> + Clone {
    recursive(|constant| {
        let typed = ty()
            .then_ignore(ws())
            .then(constant.clone())
            .map(|(ty, c)| AstTyped { ty, c });

        let struct_c = just("<{")
            .padded_by(ws())
            .ignore_then(
                typed
                    .clone()
                    .separated_by(tok(","))
                    .collect::<Vec<_>>(),
            )
            .then_ignore(tok("}>"))
            .map(|fields| AstConst::Struct(fields, true));
        let plain_struct_c = tok("{")
            .ignore_then(
                typed
                    .clone()
                    .separated_by(tok(","))
                    .collect::<Vec<_>>(),
            )
            .then_ignore(tok("}"))
            .map(|fields| AstConst::Struct(fields, false));
        let array_c = tok("[")
            .ignore_then(
                typed
                    .clone()
                    .separated_by(tok(","))
                    .collect::<Vec<_>>(),
            )
            .then_ignore(tok("]"))
            .map(AstConst::Array);
        let vector_c = tok("<")
            .ignore_then(
                typed
                    .clone()
                    .separated_by(tok(","))
                    .collect::<Vec<_>>(),
            )
            .then_ignore(tok(">"))
            .map(AstConst::Vector);

        let bitcast = just("bitcast")
            .padded_by(ws())
            .ignore_then(tok("("))
            .ignore_then(typed.clone())
            .then_ignore(tok("to"))
            .then(ty())
            .then_ignore(tok(")"))
            .map(|(v, to)| AstConst::Bitcast(Box::new(v), to));
        let ptrtoint = just("ptrtoint")
            .padded_by(ws())
            .ignore_then(tok("("))
            .ignore_then(typed.clone())
            .then_ignore(tok("to"))
            .then(ty())
            .then_ignore(tok(")"))
            .map(|(v, to)| AstConst::PtrToInt(Box::new(v), to));
        let inttoptr = just("inttoptr")
            .padded_by(ws())
            .ignore_then(tok("("))
            .ignore_then(typed.clone())
            .then_ignore(tok("to"))
            .then(ty())
            .then_ignore(tok(")"))
            .map(|(v, to)| AstConst::IntToPtr(Box::new(v), to));
        let add = just("add")
            .padded_by(ws())
            .ignore_then(tok("("))
            .ignore_then(typed.clone())
            .then_ignore(tok(","))
            .then(typed.clone())
            .then_ignore(tok(")"))
            .map(|(a, b)| AstConst::Add(a.ty.clone(), Box::new(a), Box::new(b)));
        let gep = just("getelementptr")
            .padded_by(ws())
            .ignore_then(just("inbounds").padded_by(ws()).or_not())
            .ignore_then(tok("("))
            .ignore_then(ty())
            .then_ignore(tok(","))
            .then(
                typed
                    .clone()
                    .separated_by(tok(","))
                    .at_least(1)
                    .collect::<Vec<_>>(),
            )
            .then_ignore(tok(")"))
            .map(|(source, mut rest)| {
                let base = rest.remove(0);
                AstConst::Gep {
                    source,
                    base: Box::new(base),
                    indices: rest,
                }
            });

        choice((
            just("null").to(AstConst::Null),
            just("undef").to(AstConst::Undef),
            just("zeroinitializer").to(AstConst::Zero),
            just("true").to(AstConst::Bool(true)),
            just("false").to(AstConst::Bool(false)),
            cstring().map(AstConst::Str),
            bitcast,
            ptrtoint,
            inttoptr,
            add,
            gep,
            just("@").ignore_then(ident()).map(AstConst::GlobalRef),
            float64().map(AstConst::Float),
            int64().map(AstConst::Int),
            struct_c,
            plain_struct_c,
            array_c,
            vector_c,
        ))
    })
}

fn value<'src>() -> impl Parser<'src, &'src str, AstVal, Extra<'src>> + Clone {
    choice((
        just("%").ignore_then(ident()).map(AstVal::Local),
        constant().map(AstVal::Const),
    ))
}

/// A `ty val` pair.
fn tv<'src>() -> impl Parser<'src, &'src str, Tv, Extra<'src>> + Clone {
    ty().then_ignore(ws())
        .then(value())
        .map(|(ty, v)| Tv { ty, v })
}

fn align_suffix<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> + Clone {
    tok(",")
        .ignore_then(tok("align"))
        .ignore_then(uint())
        .or_not()
        .map(|a| a.unwrap_or(0))
}

fn label_ref<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    tok("label").ignore_then(just("%")).ignore_then(ident())
}

fn bin_op<'src>() -> impl Parser<'src, &'src str, BinOp, Extra<'src>> + Clone {
    choice((
        just("add").to(BinOp::Add),
        just("sub").to(BinOp::Sub),
        just("mul").to(BinOp::Mul),
        just("udiv").to(BinOp::UDiv),
        just("sdiv").to(BinOp::SDiv),
        just("urem").to(BinOp::URem),
        just("srem").to(BinOp::SRem),
        just("and").to(BinOp::And),
        just("or").to(BinOp::Or),
        just("xor").to(BinOp::Xor),
        just("shl").to(BinOp::Shl),
        just("lshr").to(BinOp::LShr),
        just("ashr").to(BinOp::AShr),
        just("fadd").to(BinOp::FAdd),
        just("fsub").to(BinOp::FSub),
        just("fmul").to(BinOp::FMul),
        just("fdiv").to(BinOp::FDiv),
        just("frem").to(BinOp::FRem),
    ))
}

fn icmp_pred<'src>() -> impl Parser<'src, &'src str, IPred, Extra<'src>> + Clone {
    choice((
        just("eq").to(IPred::Eq),
        just("ne").to(IPred::Ne),
        just("ugt").to(IPred::Ugt),
        just("uge").to(IPred::Uge),
        just("ult").to(IPred::Ult),
        just("ule").to(IPred::Ule),
        just("sgt").to(IPred::Sgt),
        just("sge").to(IPred::Sge),
        just("slt").to(IPred::Slt),
        just("sle").to(IPred::Sle),
    ))
}

fn fcmp_pred<'src>() -> impl Parser<'src, &'src str, FPred, Extra<'src>> + Clone {
    choice((
        just("oeq").to(FPred::Oeq),
        just("ogt").to(FPred::Ogt),
        just("oge").to(FPred::Oge),
        just("olt").to(FPred::Olt),
        just("ole").to(FPred::Ole),
        just("one").to(FPred::One),
        just("ord").to(FPred::Ord),
        just("ueq").to(FPred::Ueq),
        just("ugt").to(FPred::Ugt),
        just("uge").to(FPred::Uge),
        just("ult").to(FPred::Ult),
        just("ule").to(FPred::Ule),
        just("une").to(FPred::Une),
        just("uno").to(FPred::Uno),
        just("false").to(FPred::False),
        just("true").to(FPred::True),
    ))
}

fn cast_op<'src>() -> impl Parser<'src, &'src str, CastOp, Extra<'src>> + Clone {
    choice((
        just("trunc").to(CastOp::Trunc),
        just("zext").to(CastOp::ZExt),
        just("sext").to(CastOp::SExt),
        just("fptrunc").to(CastOp::FPTrunc),
        just("fpext").to(CastOp::FPExt),
        just("fptoui").to(CastOp::FPToUI),
        just("fptosi").to(CastOp::FPToSI),
        just("uitofp").to(CastOp::UIToFP),
        just("sitofp").to(CastOp::SIToFP),
        just("ptrtoint").to(CastOp::PtrToInt),
        just("inttoptr").to(CastOp::IntToPtr),
        just("bitcast").to(CastOp::Bitcast),
    ))
}

fn rmw_op<'src>() -> impl Parser<'src, &'src str, RmwOp, Extra<'src>> + Clone {
    choice((
        just("xchg").to(RmwOp::Xchg),
        just("add").to(RmwOp::Add),
        just("sub").to(RmwOp::Sub),
        just("and").to(RmwOp::And),
        just("nand").to(RmwOp::Nand),
        just("or").to(RmwOp::Or),
        just("xor").to(RmwOp::Xor),
        just("umax").to(RmwOp::UMax),
        just("umin").to(RmwOp::UMin),
        just("max").to(RmwOp::Max),
        just("min").to(RmwOp::Min),
    ))
}

fn inst_op<'src>() -> impl Parser<'src, &'src str, AstOp, Extra<'src>> + Clone {
    let bin = bin_op()
        .then_ignore(ws())
        // Wrap flags evaporate in this dialect.
        .then_ignore(
            choice((just("nuw"), just("nsw"), just("exact")))
                .padded_by(ws())
                .repeated(),
        )
        .then(ty())
        .then_ignore(ws())
        .then(value())
        .then_ignore(tok(","))
        .then(value())
        .map(|(((op, ty), a), b)| AstOp::Bin { op, ty, a, b });

    let icmp = just("icmp")
        .padded_by(ws())
        .ignore_then(icmp_pred())
        .then_ignore(ws())
        .then(ty())
        .then_ignore(ws())
        .then(value())
        .then_ignore(tok(","))
        .then(value())
        .map(|(((pred, ty), a), b)| AstOp::ICmp { pred, ty, a, b });

    let fcmp = just("fcmp")
        .padded_by(ws())
        .ignore_then(fcmp_pred())
        .then_ignore(ws())
        .then(ty())
        .then_ignore(ws())
        .then(value())
        .then_ignore(tok(","))
        .then(value())
        .map(|(((pred, ty), a), b)| AstOp::FCmp { pred, ty, a, b });

    let load = just("load")
        .padded_by(ws())
        .ignore_then(ty())
        .then_ignore(tok(","))
        .then(tv())
        .then(align_suffix())
        .map(|((ty, ptr), align)| AstOp::Load { ty, ptr, align });

    let store = just("store")
        .padded_by(ws())
        .ignore_then(tv())
        .then_ignore(tok(","))
        .then(tv())
        .then(align_suffix())
        .map(|((val, ptr), align)| AstOp::Store { val, ptr, align });

    let gep = just("getelementptr")
        .padded_by(ws())
        .ignore_then(just("inbounds").padded_by(ws()).or_not())
        .ignore_then(ty())
        .then_ignore(tok(","))
        .then(tv().separated_by(tok(",")).at_least(1).collect::<Vec<_>>())
        .map(|(_source, mut ops)| {
            let base = ops.remove(0);
            AstOp::Gep {
                base,
                indices: ops,
            }
        });

    let cast = cast_op()
        .then_ignore(ws())
        .then(tv())
        .then_ignore(tok("to"))
        .then(ty())
        .map(|((op, val), to)| AstOp::Cast { op, val, to });

    let alloca = just("alloca")
        .padded_by(ws())
        .ignore_then(ty())
        .then(
            tok(",")
                .ignore_then(tv())
                .or_not(),
        )
        .then(align_suffix())
        .map(|((ty, count), align)| AstOp::Alloca { ty, count, align });

    let select = just("select")
        .padded_by(ws())
        .ignore_then(tv())
        .then_ignore(tok(","))
        .then(tv())
        .then_ignore(tok(","))
        .then(tv())
        .map(|((cond, a), b)| AstOp::Select { cond, a, b });

    let phi = just("phi")
        .padded_by(ws())
        .ignore_then(ty())
        .then_ignore(ws())
        .then(
            tok("[")
                .ignore_then(value())
                .then_ignore(tok(","))
                .then(just("%").ignore_then(ident()))
                .then_ignore(tok("]"))
                .separated_by(tok(","))
                .at_least(1)
                .collect::<Vec<_>>(),
        )
        .map(|(ty, incoming)| AstOp::Phi { ty, incoming });

    let call = just("call")
        .padded_by(ws())
        .ignore_then(ty())
        .then_ignore(ws())
        .then(value())
        .then_ignore(tok("("))
        .then(tv().separated_by(tok(",")).collect::<Vec<_>>())
        .then_ignore(tok(")"))
        .map(|((ret, callee), args)| AstOp::Call { ret, callee, args });

    let atomicrmw = just("atomicrmw")
        .padded_by(ws())
        .ignore_then(rmw_op())
        .then_ignore(ws())
        .then(tv())
        .then_ignore(tok(","))
        .then(tv())
        .then_ignore(just("seq_cst").or(just("monotonic")).padded_by(ws()).or_not().ignored())
        .map(|((op, ptr), val)| AstOp::AtomicRmw { op, ptr, val });

    let fence = just("fence")
        .padded_by(ws())
        .then(just("seq_cst").or_not())
        .to(AstOp::Fence);

    let extractelement = just("extractelement")
        .padded_by(ws())
        .ignore_then(tv())
        .then_ignore(tok(","))
        .then(tv())
        .map(|(vec, lane)| AstOp::ExtractElement { vec, lane });

    let insertelement = just("insertelement")
        .padded_by(ws())
        .ignore_then(tv())
        .then_ignore(tok(","))
        .then(tv())
        .then_ignore(tok(","))
        .then(tv())
        .map(|((vec, elt), lane)| AstOp::InsertElement { vec, elt, lane });

    let shufflevector = just("shufflevector")
        .padded_by(ws())
        .ignore_then(tv())
        .then_ignore(tok(","))
        .then(tv())
        .then_ignore(tok(","))
        .then(ty().then_ignore(ws()).then(constant()).map(|(ty, c)| AstTyped { ty, c }))
        .map(|((a, b), mask)| AstOp::Shuffle { a, b, mask });

    let ret = just("ret")
        .padded_by(ws())
        .ignore_then(choice((
            just("void").to(None),
            tv().map(Some),
        )))
        .map(AstOp::Ret);

    let br = just("br")
        .padded_by(ws())
        .ignore_then(choice((
            label_ref().map(AstOp::Br),
            just("i1")
                .padded_by(ws())
                .ignore_then(value())
                .then_ignore(tok(","))
                .then(label_ref())
                .then_ignore(tok(","))
                .then(label_ref())
                .map(|((cond, t), f)| AstOp::CondBr(cond, t, f)),
        )));

    let switch = just("switch")
        .padded_by(ws())
        .ignore_then(tv())
        .then_ignore(tok(","))
        .then(label_ref())
        .then_ignore(tok("["))
        .then(
            ty()
                .then_ignore(ws())
                .ignore_then(int64())
                .then_ignore(tok(","))
                .then(label_ref())
                .repeated()
                .collect::<Vec<_>>(),
        )
        .then_ignore(tok("]"))
        .map(|((cond, default), cases)| AstOp::Switch {
            cond,
            default,
            cases,
        });

    let indirectbr = just("indirectbr")
        .padded_by(ws())
        .ignore_then(tv())
        .then_ignore(tok(","))
        .then_ignore(tok("["))
        .then(
            label_ref()
                .separated_by(tok(","))
                .collect::<Vec<_>>(),
        )
        .then_ignore(tok("]"))
        .map(|(addr, dests)| AstOp::IndirectBr { addr, dests });

    let unreachable = just("unreachable").to(AstOp::Unreachable);

    choice((
        icmp,
        fcmp,
        load,
        store,
        gep,
        alloca,
        select,
        phi,
        call,
        atomicrmw,
        fence,
        extractelement,
        insertelement,
        shufflevector,
        switch,
        indirectbr,
        unreachable,
        ret,
        br,
        cast,
        bin,
    ))
}

fn body_item<'src>() -> impl Parser<'src, &'src str, AstBodyItem, Extra<'src>> + Clone {
    let label = ident()
        .then_ignore(just(":"))
        .map(AstBodyItem::Label);
    let inst = just("%")
        .ignore_then(ident())
        .then_ignore(tok("="))
        .or_not()
        .then(inst_op())
        .map(|(name, op)| AstBodyItem::Inst(AstInst { name, op }));
    label.or(inst)
}

fn item<'src>() -> impl Parser<'src, &'src str, AstItem, Extra<'src>> + Clone {
    let triple = just("target")
        .padded_by(ws())
        .ignore_then(just("triple"))
        .ignore_then(tok("="))
        .ignore_then(
            just("\"")
                .ignore_then(any().filter(|c: &char| *c != '"').repeated().to_slice())
                .then_ignore(just("\"")),
        )
        .map(|s: &str| AstItem::Triple(s.to_string()));

    let keyword = choice((
        just("private"),
        just("internal"),
        just("appending"),
        just("common"),
        just("unnamed_addr"),
        just("local_unnamed_addr"),
        just("dso_local"),
        just("linkonce_odr"),
        just("weak"),
    ))
    .map(|s: &str| s.to_string())
    .padded_by(ws());

    // An external global carries no initializer; keep it a separate arm so
    // the initializer parser cannot swallow the next item's `@name`.
    let extern_global = just("@")
        .ignore_then(ident())
        .then_ignore(tok("="))
        .then_ignore(keyword.clone().repeated())
        .then_ignore(just("external").padded_by(ws()))
        .then_ignore(keyword.clone().repeated())
        .then_ignore(choice((just("global"), just("constant"))).padded_by(ws()))
        .then(ty())
        .then(align_suffix())
        .map(|((name, ty), align)| AstItem::Global {
            name,
            keywords: vec!["external".to_string()],
            ty,
            init: None,
            align,
        });

    let global = just("@")
        .ignore_then(ident())
        .then_ignore(tok("="))
        .then(keyword.repeated().collect::<Vec<_>>())
        .then_ignore(choice((just("global"), just("constant"))).padded_by(ws()))
        .then(ty())
        .then_ignore(ws())
        .then(constant().map(Some))
        .then(align_suffix())
        .map(|((((name, keywords), ty), init), align)| AstItem::Global {
            name,
            keywords,
            ty,
            init,
            align,
        });

    let declare = just("declare")
        .padded_by(ws())
        .ignore_then(ty())
        .then_ignore(ws())
        .then_ignore(just("@"))
        .then(ident())
        .then_ignore(tok("("))
        .then(ty().separated_by(tok(",")).collect::<Vec<_>>())
        .then_ignore(tok(")"))
        .map(|((ret, name), params)| AstItem::Declare { name, ret, params });

    let param = ty()
        .then_ignore(ws())
        .then_ignore(just("%"))
        .then(ident());

    let define = just("define")
        .padded_by(ws())
        .ignore_then(ty())
        .then_ignore(ws())
        .then_ignore(just("@"))
        .then(ident())
        .then_ignore(tok("("))
        .then(param.separated_by(tok(",")).collect::<Vec<_>>())
        .then_ignore(tok(")"))
        .then(
            choice((just("minsize"), just("optsize"), just("nounwind"), just("noinline")))
                .map(|s: &str| s.to_string())
                .padded_by(ws())
                .repeated()
                .collect::<Vec<_>>(),
        )
        .then_ignore(tok("{"))
        .then(body_item().padded_by(ws()).repeated().collect::<Vec<_>>())
        .then_ignore(tok("}"))
        .map(|((((ret, name), params), attrs), body)| AstItem::Define {
            name,
            ret,
            params,
            attrs,
            body,
        });

    choice((triple, extern_global, global, declare, define))
}

fn program<'src>() -> impl Parser<'src, &'src str, Vec<AstItem>, Extra<'src>> + Clone {
    item()
        .padded_by(ws())
        .repeated()
        .collect::<Vec<_>>()
        .then_ignore(end())
}

// ─── Resolution (second pass) ───────────────────────────────────────────────

/// Parse error with context.
#[derive(Debug)]
pub struct ParseError {
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseError {}

fn err(message: impl Into<String>) -> ParseError {
    ParseError {
        message: message.into(),
    }
}

/// Parse a textual module into the arena-backed model.
pub fn parse_module(input: &str) -> Result<Module, ParseError> {
    let items = program().parse(input).into_result().map_err(|errs| {
        let msgs: Vec<String> = errs.into_iter().map(|e| format!("{e}")).collect();
        err(msgs.join("\n"))
    })?;
    resolve(items)
}

struct Resolver {
    mb: ModuleBuilder,
    globals: HashMap<String, crate::ir::GlobalId>,
    funcs: HashMap<String, FuncId>,
}

fn resolve(items: Vec<AstItem>) -> Result<Module, ParseError> {
    let mut r = Resolver {
        mb: ModuleBuilder::new(),
        globals: HashMap::new(),
        funcs: HashMap::new(),
    };

    // First create every global and function so cross-references resolve.
    for item in &items {
        match item {
            AstItem::Triple(t) => r.mb.set_triple(t),
            AstItem::Global {
                name,
                ty,
                align,
                ..
            } => {
                let vty = r.resolve_ty(ty);
                let id = r.mb.add_global(name, vty, None, *align);
                r.globals.insert(name.clone(), id);
            }
            AstItem::Declare { name, ret, params } => {
                let ret = r.resolve_ty(ret);
                let params: Vec<TyId> = params.iter().map(|t| r.resolve_ty(t)).collect();
                let id = r.mb.declare_function(name, ret, &params);
                r.funcs.insert(name.clone(), id);
            }
            AstItem::Define {
                name, ret, params, ..
            } => {
                let ret = r.resolve_ty(ret);
                let params: Vec<TyId> = params.iter().map(|(t, _)| r.resolve_ty(t)).collect();
                // Declared first; the body lands in the second pass.
                let id = r.mb.declare_function(name, ret, &params);
                r.funcs.insert(name.clone(), id);
            }
        }
    }

    // Now initializers and bodies.
    for item in items {
        match item {
            AstItem::Triple(_) => {}
            AstItem::Global {
                name, ty, init, ..
            } => {
                if let Some(init) = init {
                    let vty = r.resolve_ty(&ty);
                    let c = r.resolve_const(&init, vty)?;
                    let gid = r.globals[&name];
                    r.set_global_init(gid, c);
                }
            }
            AstItem::Declare { .. } => {}
            AstItem::Define {
                name,
                params,
                attrs,
                body,
                ..
            } => {
                let fid = r.funcs[&name];
                r.resolve_body(fid, &params, &attrs, body)?;
            }
        }
    }

    Ok(r.mb.finish())
}

impl Resolver {
    fn tys(&mut self) -> &mut TypeStore {
        self.mb.tys()
    }

    fn resolve_ty(&mut self, t: &AstTy) -> TyId {
        match t {
            AstTy::Void => self.tys().void(),
            AstTy::Int(bits) => self.tys().int(*bits),
            AstTy::Float => self.tys().float(),
            AstTy::Double => self.tys().double(),
            AstTy::Ptr(inner) => {
                let inner = self.resolve_ty(inner);
                self.tys().ptr(inner)
            }
            AstTy::Vec(_, elem) => {
                let kind = match **elem {
                    AstTy::Float => VecKind::Float32x4,
                    _ => VecKind::Int32x4,
                };
                self.tys().vector(kind)
            }
            AstTy::Array(len, elem) => {
                let elem = self.resolve_ty(elem);
                self.tys().array(elem, *len)
            }
            AstTy::Struct(fields, packed) => {
                let fields: Vec<TyId> = fields.iter().map(|f| self.resolve_ty(f)).collect();
                let packed = *packed;
                self.tys().intern(Ty::Struct { fields, packed })
            }
            AstTy::Func(ret, params) => {
                let ret = self.resolve_ty(ret);
                let params: Vec<TyId> = params.iter().map(|p| self.resolve_ty(p)).collect();
                self.tys().func(ret, params)
            }
        }
    }

    fn set_global_init(&mut self, gid: crate::ir::GlobalId, init: ConstId) {
        // ModuleBuilder has no mutator for this; poke the arena directly.
        let m = self.mb.module_mut();
        m.globals[gid].init = Some(init);
    }

    fn resolve_const(&mut self, c: &AstConst, ty: TyId) -> Result<ConstId, ParseError> {
        let resolved = match c {
            AstConst::Int(v) => Const::Int { ty, value: *v },
            AstConst::Bool(b) => Const::Int {
                ty,
                value: i64::from(*b),
            },
            AstConst::Float(v) => Const::Float { ty, value: *v },
            AstConst::Null => Const::Null(ty),
            AstConst::Undef => Const::Undef(ty),
            AstConst::Zero => Const::Zero(ty),
            AstConst::Str(bytes) => Const::Str {
                ty,
                bytes: bytes.clone(),
            },
            AstConst::Struct(fields, packed) => {
                let mut field_tys = Vec::with_capacity(fields.len());
                let mut ids = Vec::with_capacity(fields.len());
                for field in fields {
                    let fty = self.resolve_ty(&field.ty);
                    field_tys.push(fty);
                    ids.push(self.resolve_const(&field.c, fty)?);
                }
                let packed = *packed;
                let sty = self.tys().intern(Ty::Struct {
                    fields: field_tys,
                    packed,
                });
                Const::Struct {
                    ty: sty,
                    fields: ids,
                }
            }
            AstConst::Array(elems) => {
                let mut ids = Vec::with_capacity(elems.len());
                let mut elem_ty = None;
                for elem in elems {
                    let ety = self.resolve_ty(&elem.ty);
                    elem_ty.get_or_insert(ety);
                    ids.push(self.resolve_const(&elem.c, ety)?);
                }
                let aty = match elem_ty {
                    Some(ety) => self.tys().array(ety, ids.len() as u32),
                    None => ty,
                };
                Const::Array {
                    ty: aty,
                    elems: ids,
                }
            }
            AstConst::Vector(lanes) => {
                let mut ids = Vec::with_capacity(lanes.len());
                for lane in lanes {
                    let lty = self.resolve_ty(&lane.ty);
                    ids.push(self.resolve_const(&lane.c, lty)?);
                }
                Const::Vector { ty, lanes: ids }
            }
            AstConst::GlobalRef(name) => {
                if let Some(&f) = self.funcs.get(name) {
                    Const::Function(f)
                } else if let Some(&g) = self.globals.get(name) {
                    Const::Global(g)
                } else {
                    return Err(err(format!("unknown global @{name}")));
                }
            }
            AstConst::Bitcast(inner, to) => {
                let ity = self.resolve_ty(&inner.ty);
                let val = self.resolve_const(&inner.c, ity)?;
                let to = self.resolve_ty(to);
                Const::Expr(ConstExpr::Bitcast { val, to })
            }
            AstConst::PtrToInt(inner, to) => {
                let ity = self.resolve_ty(&inner.ty);
                let val = self.resolve_const(&inner.c, ity)?;
                let to = self.resolve_ty(to);
                Const::Expr(ConstExpr::PtrToInt { val, to })
            }
            AstConst::IntToPtr(inner, to) => {
                let ity = self.resolve_ty(&inner.ty);
                let val = self.resolve_const(&inner.c, ity)?;
                let to = self.resolve_ty(to);
                Const::Expr(ConstExpr::IntToPtr { val, to })
            }
            AstConst::Add(aty, a, b) => {
                let ety = self.resolve_ty(aty);
                let lty = self.resolve_ty(&a.ty);
                let rty = self.resolve_ty(&b.ty);
                let lhs = self.resolve_const(&a.c, lty)?;
                let rhs = self.resolve_const(&b.c, rty)?;
                Const::Expr(ConstExpr::Add { ty: ety, lhs, rhs })
            }
            AstConst::Gep {
                source,
                base,
                indices,
            } => {
                let sty = self.resolve_ty(source);
                let bty = self.resolve_ty(&base.ty);
                let base_id = self.resolve_const(&base.c, bty)?;
                let mut offset: i64 = 0;
                let mut cur = sty;
                for (i, index) in indices.iter().enumerate() {
                    let AstConst::Int(v) = index.c else {
                        return Err(err("constant gep index must be an integer"));
                    };
                    if i == 0 {
                        offset += v * self.mb.module().tys.alloc_size(cur) as i64;
                        continue;
                    }
                    match self.mb.module().tys.get(cur).clone() {
                        Ty::Struct { fields, packed } => {
                            let layout = self.mb.module().tys.struct_layout(&fields, packed);
                            offset += layout.offsets[v as usize] as i64;
                            cur = fields[v as usize];
                        }
                        Ty::Array { elem, .. } => {
                            offset += v * self.mb.module().tys.alloc_size(elem) as i64;
                            cur = elem;
                        }
                        other => {
                            return Err(err(format!("cannot index {other:?} in constant gep")))
                        }
                    }
                }
                let result = self.tys().ptr(cur);
                Const::Expr(ConstExpr::Gep {
                    base: base_id,
                    offset,
                    ty: result,
                })
            }
        };
        Ok(self.mb.constant(resolved))
    }

    fn resolve_body(
        &mut self,
        fid: FuncId,
        params: &[(AstTy, String)],
        attrs: &[String],
        body: Vec<AstBodyItem>,
    ) -> Result<(), ParseError> {
        // Group body items into blocks; the first block may be unlabeled.
        let mut blocks: Vec<(Option<String>, Vec<AstInst>)> = Vec::new();
        for item in body {
            match item {
                AstBodyItem::Label(l) => blocks.push((Some(l), Vec::new())),
                AstBodyItem::Inst(inst) => {
                    if blocks.is_empty() {
                        blocks.push((None, Vec::new()));
                    }
                    blocks.last_mut().unwrap().1.push(inst);
                }
            }
        }
        if blocks.is_empty() {
            return Err(err("function body has no blocks"));
        }

        let mut block_index: HashMap<String, usize> = HashMap::new();
        for (i, (label, _)) in blocks.iter().enumerate() {
            if let Some(label) = label {
                block_index.insert(label.clone(), i);
            }
        }

        // Pre-assign instruction IDs so forward references (phis) resolve.
        let mut locals: HashMap<String, Value> = HashMap::new();
        for (i, (_, name)) in params.iter().enumerate() {
            locals.insert(name.clone(), Value::Arg(i as u32));
        }
        {
            let mut next = 0u32;
            for (_, insts) in &blocks {
                for inst in insts {
                    let id = crate::ir::Id::new(next);
                    next += 1;
                    if let Some(name) = &inst.name {
                        locals.insert(name.clone(), Value::Inst(id));
                    }
                }
            }
        }

        let min_size = attrs.iter().any(|a| a == "minsize" || a == "optsize");
        {
            let m = self.mb.module_mut();
            m.funcs[fid].min_size = min_size;
            for (i, (_, name)) in params.iter().enumerate() {
                m.funcs[fid].params[i].name = Some(name.clone());
            }
        }

        let resolved_blocks: Vec<(Option<String>, Vec<AstInst>)> = blocks;
        for (label, insts) in resolved_blocks {
            let block = {
                let m = self.mb.module_mut();
                let f = &mut m.funcs[fid];
                f.blocks.push(crate::ir::BasicBlock {
                    label: label.clone(),
                    insts: Vec::new(),
                });
                f.blocks.len() - 1
            };
            for inst in insts {
                let (ty, kind) = self.resolve_inst(&inst, &locals, &block_index)?;
                let m = self.mb.module_mut();
                let f = &mut m.funcs[fid];
                let id = f.insts.push(crate::ir::Inst {
                    ty,
                    kind,
                    name: inst.name.clone(),
                    loc: None,
                });
                f.blocks[block].insts.push(id);
            }
        }
        Ok(())
    }

    fn resolve_val(
        &mut self,
        v: &AstVal,
        ty: TyId,
        locals: &HashMap<String, Value>,
    ) -> Result<Value, ParseError> {
        match v {
            AstVal::Local(name) => locals
                .get(name)
                .copied()
                .ok_or_else(|| err(format!("unknown local %{name}"))),
            AstVal::Const(c) => Ok(Value::Const(self.resolve_const(c, ty)?)),
        }
    }

    fn resolve_tv(
        &mut self,
        tv: &Tv,
        locals: &HashMap<String, Value>,
    ) -> Result<(TyId, Value), ParseError> {
        let ty = self.resolve_ty(&tv.ty);
        let v = self.resolve_val(&tv.v, ty, locals)?;
        Ok((ty, v))
    }

    fn block_of(
        &self,
        label: &str,
        block_index: &HashMap<String, usize>,
    ) -> Result<usize, ParseError> {
        block_index
            .get(label)
            .copied()
            .ok_or_else(|| err(format!("unknown block label %{label}")))
    }

    fn resolve_inst(
        &mut self,
        inst: &AstInst,
        locals: &HashMap<String, Value>,
        block_index: &HashMap<String, usize>,
    ) -> Result<(TyId, InstKind), ParseError> {
        let void = self.tys().void();
        Ok(match &inst.op {
            AstOp::Bin { op, ty, a, b } => {
                let ty = self.resolve_ty(ty);
                let a = self.resolve_val(a, ty, locals)?;
                let b = self.resolve_val(b, ty, locals)?;
                (ty, InstKind::Binary { op: *op, lhs: a, rhs: b })
            }
            AstOp::ICmp { pred, ty, a, b } => {
                let ty = self.resolve_ty(ty);
                let a = self.resolve_val(a, ty, locals)?;
                let b = self.resolve_val(b, ty, locals)?;
                let i1 = self.tys().i1();
                (i1, InstKind::ICmp { pred: *pred, lhs: a, rhs: b })
            }
            AstOp::FCmp { pred, ty, a, b } => {
                let ty = self.resolve_ty(ty);
                let a = self.resolve_val(a, ty, locals)?;
                let b = self.resolve_val(b, ty, locals)?;
                let i1 = self.tys().i1();
                (i1, InstKind::FCmp { pred: *pred, lhs: a, rhs: b })
            }
            AstOp::Load { ty, ptr, align } => {
                let ty = self.resolve_ty(ty);
                let (_, ptr) = self.resolve_tv(ptr, locals)?;
                (ty, InstKind::Load { ptr, align: *align })
            }
            AstOp::Store { val, ptr, align } => {
                let (_, val) = self.resolve_tv(val, locals)?;
                let (_, ptr) = self.resolve_tv(ptr, locals)?;
                (void, InstKind::Store { val, ptr, align: *align })
            }
            AstOp::Gep { base, indices } => {
                let (bty, base_v) = self.resolve_tv(base, locals)?;
                let mut resolved = Vec::with_capacity(indices.len());
                let mut cur = self.mb.module().tys.pointee(bty);
                for (i, index) in indices.iter().enumerate() {
                    let (_, v) = self.resolve_tv(index, locals)?;
                    resolved.push(v);
                    if i == 0 {
                        continue;
                    }
                    cur = match self.mb.module().tys.get(cur).clone() {
                        Ty::Struct { fields, .. } => {
                            let Some(field) = self.mb.module().const_int_value(v) else {
                                return Err(err("struct gep index must be constant"));
                            };
                            fields[field as usize]
                        }
                        Ty::Array { elem, .. } => elem,
                        other => {
                            return Err(err(format!("cannot index {other:?} in gep")))
                        }
                    };
                }
                let result = self.tys().ptr(cur);
                (result, InstKind::Gep { base: base_v, indices: resolved })
            }
            AstOp::Cast { op, val, to } => {
                let (_, v) = self.resolve_tv(val, locals)?;
                let to = self.resolve_ty(to);
                (to, InstKind::Cast { op: *op, val: v })
            }
            AstOp::Alloca { ty, count, align } => {
                let allocated = self.resolve_ty(ty);
                let count = match count {
                    Some(tv) => self.resolve_tv(tv, locals)?.1,
                    None => {
                        let i32t = self.tys().i32();
                        Value::Const(self.mb.constant(Const::Int { ty: i32t, value: 1 }))
                    }
                };
                let result = self.tys().ptr(allocated);
                (
                    result,
                    InstKind::Alloca {
                        allocated,
                        count,
                        align: *align,
                    },
                )
            }
            AstOp::Select { cond, a, b } => {
                let (_, cond) = self.resolve_tv(cond, locals)?;
                let (ty, a) = self.resolve_tv(a, locals)?;
                let (_, b) = self.resolve_tv(b, locals)?;
                (
                    ty,
                    InstKind::Select {
                        cond,
                        if_true: a,
                        if_false: b,
                    },
                )
            }
            AstOp::Phi { ty, incoming } => {
                let ty = self.resolve_ty(ty);
                let mut resolved = Vec::with_capacity(incoming.len());
                for (v, label) in incoming {
                    let v = self.resolve_val(v, ty, locals)?;
                    let block = self.block_of(label, block_index)?;
                    resolved.push((v, block));
                }
                (ty, InstKind::Phi { incoming: resolved })
            }
            AstOp::Call { ret, callee, args } => {
                let ret = self.resolve_ty(ret);
                let mut arg_vals = Vec::with_capacity(args.len());
                let mut arg_tys = Vec::with_capacity(args.len());
                for arg in args {
                    let (ty, v) = self.resolve_tv(arg, locals)?;
                    arg_tys.push(ty);
                    arg_vals.push(v);
                }
                let callee = match callee {
                    AstVal::Const(AstConst::GlobalRef(name)) => {
                        let Some(&f) = self.funcs.get(name) else {
                            return Err(err(format!("call to unknown function @{name}")));
                        };
                        Callee::Direct(f)
                    }
                    other => {
                        let sig = self.tys().func(ret, arg_tys);
                        let pty = self.tys().ptr(sig);
                        let ptr = self.resolve_val(other, pty, locals)?;
                        Callee::Indirect { ptr, sig }
                    }
                };
                (ret, InstKind::Call { callee, args: arg_vals })
            }
            AstOp::AtomicRmw { op, ptr, val } => {
                let (_, ptr) = self.resolve_tv(ptr, locals)?;
                let (ty, val) = self.resolve_tv(val, locals)?;
                (ty, InstKind::AtomicRmw { op: *op, ptr, val })
            }
            AstOp::Fence => (void, InstKind::Fence),
            AstOp::ExtractElement { vec, lane } => {
                let (vty, vec) = self.resolve_tv(vec, locals)?;
                let (_, lane) = self.resolve_tv(lane, locals)?;
                let elem = match self.mb.module().tys.get(vty) {
                    Ty::Vector(VecKind::Float32x4) => self.tys().float(),
                    _ => self.tys().i32(),
                };
                (elem, InstKind::ExtractElement { vec, lane })
            }
            AstOp::InsertElement { vec, elt, lane } => {
                let (vty, vec) = self.resolve_tv(vec, locals)?;
                let (_, elt) = self.resolve_tv(elt, locals)?;
                let (_, lane) = self.resolve_tv(lane, locals)?;
                (vty, InstKind::InsertElement { vec, elt, lane })
            }
            AstOp::Shuffle { a, b, mask } => {
                let (aty, a) = self.resolve_tv(a, locals)?;
                let (_, b) = self.resolve_tv(b, locals)?;
                let mask = resolve_shuffle_mask(&mask.c)?;
                (aty, InstKind::Shuffle { a, b, mask })
            }
            AstOp::Ret(v) => {
                let v = match v {
                    Some(tv) => Some(self.resolve_tv(tv, locals)?.1),
                    None => None,
                };
                (void, InstKind::Ret(v))
            }
            AstOp::Br(label) => {
                let dest = self.block_of(label, block_index)?;
                (void, InstKind::Br { dest })
            }
            AstOp::CondBr(cond, t, f) => {
                let i1 = self.tys().i1();
                let cond = self.resolve_val(cond, i1, locals)?;
                let if_true = self.block_of(t, block_index)?;
                let if_false = self.block_of(f, block_index)?;
                (
                    void,
                    InstKind::CondBr {
                        cond,
                        if_true,
                        if_false,
                    },
                )
            }
            AstOp::Switch {
                cond,
                default,
                cases,
            } => {
                let (_, cond) = self.resolve_tv(cond, locals)?;
                let default = self.block_of(default, block_index)?;
                let mut resolved = Vec::with_capacity(cases.len());
                for (value, label) in cases {
                    resolved.push((*value, self.block_of(label, block_index)?));
                }
                (
                    void,
                    InstKind::Switch {
                        cond,
                        default,
                        cases: resolved,
                    },
                )
            }
            AstOp::IndirectBr { addr, dests } => {
                let (_, addr) = self.resolve_tv(addr, locals)?;
                let mut resolved = Vec::with_capacity(dests.len());
                for label in dests {
                    resolved.push(self.block_of(label, block_index)?);
                }
                (void, InstKind::IndirectBr { addr, dests: resolved })
            }
            AstOp::Unreachable => (void, InstKind::Unreachable),
        })
    }
}

fn resolve_shuffle_mask(mask: &AstConst) -> Result<Vec<i32>, ParseError> {
    match mask {
        AstConst::Zero => Ok(vec![0; 4]),
        AstConst::Undef => Ok(vec![-1; 4]),
        AstConst::Vector(lanes) => lanes
            .iter()
            .map(|lane| match lane.c {
                AstConst::Int(v) => Ok(v as i32),
                AstConst::Undef => Ok(-1),
                _ => Err(err("shuffle mask lanes must be integers or undef")),
            })
            .collect(),
        _ => Err(err("bad shuffle mask")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_function() {
        let m = parse_module(
            r#"
define i32 @add(i32 %a, i32 %b) {
entry:
  %r = add i32 %a, %b
  ret i32 %r
}
"#,
        )
        .unwrap();
        let (_, f) = m.funcs.iter().next().unwrap();
        assert_eq!(f.name, "add");
        assert_eq!(f.blocks.len(), 1);
        assert_eq!(f.blocks[0].insts.len(), 2);
    }

    #[test]
    fn parse_global_string() {
        let m = parse_module(r#"@s = private constant [6 x i8] c"hello\00", align 1"#).unwrap();
        let (_, g) = m.globals.iter().next().unwrap();
        assert_eq!(g.name, "s");
        let init = g.init.unwrap();
        match &m.consts[init] {
            Const::Str { bytes, .. } => assert_eq!(bytes, b"hello\0"),
            other => panic!("expected string constant, got {other:?}"),
        }
    }

    #[test]
    fn parse_branches_and_phi() {
        let m = parse_module(
            r#"
define i32 @pick(i1 %c) {
entry:
  br i1 %c, label %a, label %b
a:
  br label %join
b:
  br label %join
join:
  %r = phi i32 [ 1, %a ], [ 2, %b ]
  ret i32 %r
}
"#,
        )
        .unwrap();
        let (_, f) = m.funcs.iter().next().unwrap();
        assert_eq!(f.blocks.len(), 4);
        let join = &f.blocks[3];
        let phi = &f.insts[join.insts[0]];
        match &phi.kind {
            InstKind::Phi { incoming } => {
                assert_eq!(incoming.len(), 2);
                assert_eq!(incoming[0].1, 1);
                assert_eq!(incoming[1].1, 2);
            }
            other => panic!("expected phi, got {other:?}"),
        }
    }

    #[test]
    fn parse_ptrtoint_struct() {
        let m = parse_module(
            r#"
define i32 @f(i32 %x) {
entry:
  ret i32 %x
}
@table = internal constant <{ i32, i32 }> <{ i32 ptrtoint (i32 (i32)* @f to i32), i32 4 }>
"#,
        )
        .unwrap();
        let (_, g) = m.globals.iter().next().unwrap();
        let init = g.init.unwrap();
        match &m.consts[init] {
            Const::Struct { fields, .. } => assert_eq!(fields.len(), 2),
            other => panic!("expected struct constant, got {other:?}"),
        }
    }

    #[test]
    fn parse_declare_and_call() {
        let m = parse_module(
            r#"
declare i32 @puts(i8*)
define void @main() {
entry:
  %r = call i32 @puts(i8* null)
  ret void
}
"#,
        )
        .unwrap();
        assert_eq!(m.funcs.len(), 2);
        let (_, main) = m.funcs.iter().nth(1).unwrap();
        let call = &main.insts[main.blocks[0].insts[0]];
        assert!(matches!(
            call.kind,
            InstKind::Call {
                callee: Callee::Direct(_),
                ..
            }
        ));
    }

    #[test]
    fn parse_error_reports_location() {
        let result = parse_module("this is not IR");
        assert!(result.is_err());
    }

    #[test]
    fn parse_switch() {
        let m = parse_module(
            r#"
define void @f(i32 %x) {
entry:
  switch i32 %x, label %def [
    i32 0, label %a
    i32 1, label %b
  ]
a:
  br label %def
b:
  br label %def
def:
  ret void
}
"#,
        )
        .unwrap();
        let (_, f) = m.funcs.iter().next().unwrap();
        match &f.insts[f.terminator(0)].kind {
            InstKind::Switch { cases, .. } => assert_eq!(cases.len(), 2),
            other => panic!("expected switch, got {other:?}"),
        }
    }
}
