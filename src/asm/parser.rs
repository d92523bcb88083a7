//! Two passes over the token lines: the first declares every `.func` and
//! resolves `.native` imports, the second assembles bodies through
//! [`CodeBuilder`] and publishes them with [`Function::define`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::lexer::{Spanned, Token};
use super::{AsmError, Module, Span, codes};
use crate::vm::builder::{Bank, BuildError, CodeBuilder, JumpLabel, MAX_REGS};
use crate::vm::disasm::CASTB_NAMES;
use crate::vm::function::{AddressConst, DefineError, Function, FunctionFlags, Proto};
use crate::vm::opcodes::*;
use crate::vm::scope::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reg {
    bank: Bank,
    index: u8,
    /// 1 for scalars, 2 or 3 for vector groups.
    width: u8,
}

impl Reg {
    fn flags(self) -> u8 {
        let multi = match self.width {
            2 => REGT_MULTIREG2,
            3 => REGT_MULTIREG3,
            _ => 0,
        };
        self.bank as u8 | multi
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Arg {
    Reg(Reg),
    AddrOf(Reg),
    Int(i64),
    Float(f64),
    KInt(i64),
    KFloat(f64),
    KStr(String),
    /// `@name`, or `@null` as `None`.
    Address(Option<String>),
    Word(String),
}

#[derive(Debug, Clone)]
struct Item {
    arg: Arg,
    span: Span,
}

struct Header {
    line: usize,
    func: Arc<Function>,
    file: String,
    span: Span,
}

/// Per-function assembly state.
struct Body<'h> {
    header: &'h Header,
    code: CodeBuilder,
    labels: HashMap<String, usize>,
    fixups: Vec<(JumpLabel, String, Span)>,
    used: [usize; 4],
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum List {
    Args,
    Returns,
}

const STRING_BRANCHES: [(&str, u8, bool); 6] = [
    ("beqs", CMP_EQ, true),
    ("bnes", CMP_EQ, false),
    ("blts", CMP_LT, true),
    ("bges", CMP_LT, false),
    ("bles", CMP_LE, true),
    ("bgts", CMP_LE, false),
];

fn line_span(line: &[Spanned]) -> Span {
    match (line.first(), line.last()) {
        (Some((_, first)), Some((_, last))) => first.merge(*last),
        _ => Span::UNKNOWN,
    }
}

fn syntax(span: Span, message: impl Into<String>) -> AsmError {
    AsmError::new(codes::SYNTAX, span, message)
}

fn unexpected(found: Option<&Spanned>, wanted: &str, fallback: Span) -> AsmError {
    match found {
        Some((tok, span)) => syntax(*span, format!("expected {wanted}, found {}", tok.describe())),
        None => syntax(fallback, format!("expected {wanted} at end of line")),
    }
}

fn encoding(span: Span) -> impl Fn(BuildError) -> AsmError {
    move |e| match e {
        BuildError::Verify(v) => {
            let message = match v.pc {
                Some(pc) => format!("{} in `{}` at pc {pc}", v.message, v.function),
                None => format!("{} in `{}`", v.message, v.function),
            };
            AsmError { span, message, code: codes::VERIFY, hint: v.hint }
        }
        other => AsmError::new(codes::ENCODING, span, other.to_string()),
    }
}

/// `d3` → (Int, 3). Anything else is not a register name.
fn register_name(text: &str) -> Option<(Bank, usize)> {
    let mut chars = text.chars();
    let bank = match chars.next()? {
        'd' => Bank::Int,
        'f' => Bank::Float,
        's' => Bank::String,
        'a' => Bank::Pointer,
        _ => return None,
    };
    let digits = chars.as_str();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((bank, digits.parse().ok()?))
}

fn register(text: &str, width: i64, span: Span) -> Result<Option<Reg>, AsmError> {
    let Some((bank, index)) = register_name(text) else {
        return Ok(None);
    };
    if index + width as usize > MAX_REGS {
        return Err(AsmError::new(codes::OPERAND, span, format!("register `{text}` is out of range"))
            .with_hint(format!("each bank holds at most {MAX_REGS} registers")));
    }
    if width != 1 && (bank != Bank::Float || !(2..=3).contains(&width)) {
        return Err(AsmError::new(codes::OPERAND, span, format!("`{text}:{width}` is not a vector group"))
            .with_hint("vector groups are float registers of width 2 or 3, e.g. `f0:3`"));
    }
    Ok(Some(Reg { bank, index: index as u8, width: width as u8 }))
}

fn operand(group: &[Spanned], fallback: Span) -> Result<Item, AsmError> {
    let span = if group.is_empty() { fallback } else { line_span(group) };
    let arg = match group {
        [(Token::Ident(w), _)] => match register(w, 1, span)? {
            Some(r) => Arg::Reg(r),
            None => Arg::Word(w.clone()),
        },
        [(Token::Ident(w), _), (Token::Colon, _), (Token::Int(n), _)] => match register(w, *n, span)? {
            Some(r) => Arg::Reg(r),
            None => return Err(syntax(span, format!("`{w}` is not a register"))),
        },
        [(Token::Amp, _), rest @ ..] => match operand(rest, span)?.arg {
            Arg::Reg(r) => Arg::AddrOf(r),
            _ => return Err(syntax(span, "`&` must be followed by a register")),
        },
        [(Token::Hash, _), (Token::Int(v), _)] => Arg::KInt(*v),
        [(Token::Hash, _), (Token::Float(v), _)] => Arg::KFloat(*v),
        [(Token::Hash, _), (Token::Str(s), _)] => Arg::KStr(s.clone()),
        [(Token::At, _), (Token::Ident(n), _)] => Arg::Address((n != "null").then(|| n.clone())),
        [(Token::Int(v), _)] => Arg::Int(*v),
        [(Token::Float(v), _)] => Arg::Float(*v),
        [] => return Err(syntax(span, "missing operand")),
        _ => {
            return Err(syntax(span, "malformed operand")
                .with_hint("operands are registers (d0, f1:3), constants (#5, #\"s\"), @func, immediates or labels"));
        }
    };
    Ok(Item { arg, span })
}

fn operands(tokens: &[Spanned], fallback: Span) -> Result<Vec<Item>, AsmError> {
    if tokens.is_empty() {
        return Ok(Vec::new());
    }
    tokens.split(|(t, _)| *t == Token::Comma).map(|group| operand(group, fallback)).collect()
}

/// Operand kinds an instruction spells out, in order.
fn shape(info: &OpInfo) -> Vec<Operand> {
    let mut kinds = Vec::with_capacity(3);
    if info.mode.a != Operand::Unused {
        kinds.push(info.mode.a);
    }
    if info.mode.b != Operand::Unused {
        kinds.push(info.mode.b);
    }
    if info.mode.c != Operand::Unused && !info.mode.b.is_joint() {
        kinds.push(info.mode.c);
    }
    kinds
}

fn spelling(kind: Operand) -> &'static str {
    match kind {
        Operand::IntReg => "dN",
        Operand::FloatReg => "fN",
        Operand::StringReg => "sN",
        Operand::PointerReg => "aN",
        Operand::Vec2Reg => "fN:2",
        Operand::Vec3Reg => "fN:3",
        Operand::IntKonst | Operand::JointIntKonst => "#int",
        Operand::FloatKonst | Operand::JointFloatKonst => "#float",
        Operand::StringKonst | Operand::JointStringKonst => "#\"text\"",
        Operand::PointerKonst | Operand::JointPointerKonst => "@func",
        Operand::Imm | Operand::JointImm => "imm",
        Operand::UImm | Operand::JointUImm => "uimm",
        Operand::CmpFlags => "flags",
        Operand::Imm24 => "label",
        Operand::Unused | Operand::Variable => "?",
    }
}

fn fits(kind: Operand, arg: &Arg) -> bool {
    let reg = |bank: Bank, width: u8| matches!(arg, Arg::Reg(r) if r.bank == bank && r.width == width);
    match kind {
        Operand::IntReg => reg(Bank::Int, 1),
        Operand::FloatReg => reg(Bank::Float, 1),
        Operand::StringReg => reg(Bank::String, 1),
        Operand::PointerReg => reg(Bank::Pointer, 1),
        Operand::Vec2Reg => reg(Bank::Float, 2),
        Operand::Vec3Reg => reg(Bank::Float, 3),
        Operand::IntKonst | Operand::JointIntKonst => matches!(arg, Arg::KInt(_) | Arg::Int(_)),
        Operand::FloatKonst | Operand::JointFloatKonst => matches!(arg, Arg::KFloat(_) | Arg::KInt(_) | Arg::Float(_)),
        Operand::StringKonst | Operand::JointStringKonst => matches!(arg, Arg::KStr(_)),
        Operand::PointerKonst | Operand::JointPointerKonst => matches!(arg, Arg::Address(_) | Arg::Word(_)),
        Operand::Imm | Operand::UImm | Operand::CmpFlags | Operand::JointImm | Operand::JointUImm => {
            matches!(arg, Arg::Int(_))
        }
        Operand::Imm24 | Operand::Unused | Operand::Variable => false,
    }
}

fn int_in<T: TryFrom<i64>>(v: i64, span: Span) -> Result<T, AsmError> {
    T::try_from(v).map_err(|_| AsmError::new(codes::OPERAND, span, format!("value {v} out of range for this operand")))
}

fn word(item: &Item) -> Result<&str, AsmError> {
    match &item.arg {
        Arg::Word(w) => Ok(w),
        _ => Err(AsmError::new(codes::OPERAND, item.span, "expected a name")),
    }
}

fn arity(mnemonic: &str, span: Span, form: &str) -> AsmError {
    AsmError::new(codes::OPERAND, span, format!("wrong number of operands for `{mnemonic}`"))
        .with_hint(format!("expected `{mnemonic} {form}`"))
}

/// Argument slot tags and the return tag for a header type letter.
fn header_type(word: &str) -> Option<(u8, usize)> {
    Some(match word {
        "d" => (REGT_INT, 1),
        "f" => (REGT_FLOAT, 1),
        "s" => (REGT_STRING, 1),
        "a" => (REGT_POINTER, 1),
        "v2" => (REGT_FLOAT | REGT_MULTIREG2, 2),
        "v3" => (REGT_FLOAT | REGT_MULTIREG3, 3),
        _ => return None,
    })
}

impl<'h> Body<'h> {
    fn new(header: &'h Header) -> Self {
        Body {
            header,
            code: CodeBuilder::new(header.func.name.clone()),
            labels: HashMap::new(),
            fixups: Vec::new(),
            used: [0; 4],
        }
    }

    fn touch(&mut self, arg: &Arg) {
        if let Arg::Reg(r) | Arg::AddrOf(r) = arg {
            let used = &mut self.used[r.bank as usize];
            *used = (*used).max(r.index as usize + r.width as usize);
        }
    }

    fn label(&mut self, name: &str, span: Span) -> Result<(), AsmError> {
        if register_name(name).is_some() {
            return Err(AsmError::new(codes::SYNTAX, span, format!("label `{name}` looks like a register")));
        }
        if self.labels.insert(name.to_string(), self.code.pc()).is_some() {
            return Err(AsmError::new(codes::DUPLICATE, span, format!("label `{name}` is defined twice")));
        }
        Ok(())
    }

    fn jump_to(&mut self, item: &Item) -> Result<(), AsmError> {
        let name = word(item)?.to_string();
        let jump = self.code.emit_jump();
        self.fixups.push((jump, name, item.span));
        Ok(())
    }

    /// Resolve labels, size the banks and publish the body.
    fn finish(mut self) -> Result<(), AsmError> {
        let span = self.header.span;
        for (jump, name, at) in std::mem::take(&mut self.fixups) {
            let target = *self
                .labels
                .get(&name)
                .ok_or_else(|| AsmError::new(codes::UNDEFINED, at, format!("undefined label `{name}`")))?;
            self.code.backpatch(jump, target).map_err(encoding(at))?;
        }
        let func = &self.header.func;
        let mut params = [0usize; 4];
        for &tag in &func.proto.args {
            params[(tag & REGT_TYPE) as usize] += 1;
        }
        for bank in Bank::ALL {
            let need = self.used[bank as usize].max(params[bank as usize]);
            if need > 0 {
                self.code.alloc(bank, need).map_err(encoding(span))?;
            }
        }
        let body = self.code.finish(&self.header.file).map_err(encoding(span))?;
        debug!(function = %func.name, instructions = body.code.len(), "assembled");
        func.define(body).map_err(|e| match e {
            DefineError::Verify(v) => encoding(span)(BuildError::Verify(v)),
            other => AsmError::new(codes::DUPLICATE, span, other.to_string()),
        })
    }
}

pub struct Assembler<'a> {
    tokens: &'a [Spanned],
    natives: &'a [Arc<Function>],
    names: HashMap<String, Arc<Function>>,
}

impl<'a> Assembler<'a> {
    pub fn new(tokens: &'a [Spanned], natives: &'a [Arc<Function>]) -> Self {
        Assembler { tokens, natives, names: HashMap::new() }
    }

    pub fn run(mut self) -> Result<Module, AsmError> {
        let lines: Vec<&[Spanned]> =
            self.tokens.split(|(t, _)| *t == Token::Newline).filter(|l| !l.is_empty()).collect();
        let mut module = Module::default();
        let headers = self.declare(&lines, &mut module)?;
        self.define(&lines, &headers)?;
        Ok(module)
    }

    fn bind(&mut self, func: Arc<Function>, span: Span) -> Result<(), AsmError> {
        if self.names.contains_key(&func.name) {
            return Err(AsmError::new(codes::DUPLICATE, span, format!("`{}` is declared twice", func.name)));
        }
        self.names.insert(func.name.clone(), func);
        Ok(())
    }

    // ── Pass 1 ──────────────────────────────────────────────────────

    fn declare(&mut self, lines: &[&[Spanned]], module: &mut Module) -> Result<Vec<Header>, AsmError> {
        let mut headers = Vec::new();
        let mut open: Option<Span> = None;
        for (i, line) in lines.iter().enumerate() {
            let span = line_span(line);
            let Token::Directive(d) = &line[0].0 else {
                if open.is_none() {
                    return Err(syntax(span, "instruction outside a function")
                        .with_hint("start a function with `.func name`"));
                }
                continue;
            };
            match d.as_str() {
                "func" => {
                    if open.is_some() {
                        return Err(syntax(span, "`.func` inside another function")
                            .with_hint("close the previous function with `.end`"));
                    }
                    let header = self.header(i, line)?;
                    self.bind(header.func.clone(), span)?;
                    module.functions.push(header.func.clone());
                    headers.push(header);
                    open = Some(span);
                }
                "end" => {
                    if open.take().is_none() {
                        return Err(syntax(span, "`.end` without `.func`"));
                    }
                    if let Some(extra) = line.get(1) {
                        return Err(unexpected(Some(extra), "end of line", span));
                    }
                }
                "native" => {
                    if open.is_some() {
                        return Err(syntax(span, "`.native` inside a function"));
                    }
                    let (name, at) = match line.get(1) {
                        Some((Token::Ident(n), s)) => (n.as_str(), *s),
                        other => return Err(unexpected(other, "a native name", span)),
                    };
                    let native = self.natives.iter().find(|f| f.name == name).ok_or_else(|| {
                        AsmError::new(codes::UNDEFINED, at, format!("no native named `{name}` is registered"))
                    })?;
                    self.bind(native.clone(), at)?;
                    module.natives.push(native.clone());
                }
                "line" => {
                    if open.is_none() {
                        return Err(syntax(span, "`.line` outside a function"));
                    }
                }
                other => {
                    return Err(syntax(span, format!("unknown directive `.{other}`"))
                        .with_hint("directives are .func, .end, .line and .native"));
                }
            }
        }
        if let Some(span) = open {
            return Err(syntax(span, "function is missing `.end`"));
        }
        Ok(headers)
    }

    fn header(&self, line_index: usize, line: &[Spanned]) -> Result<Header, AsmError> {
        let span = line_span(line);
        let name = match line.get(1) {
            Some((Token::Ident(n), _)) => n.clone(),
            other => return Err(unexpected(other, "a function name", span)),
        };
        let mut flags = FunctionFlags::NONE;
        let mut side = Side::PlainData;
        let mut proto = Proto::default();
        let mut file = String::new();
        let mut list = None;
        let mut rest = line[2..].iter();
        while let Some((tok, at)) = rest.next() {
            let Token::Ident(w) = tok else {
                return Err(unexpected(Some(&(tok.clone(), *at)), "a header keyword", span));
            };
            match w.as_str() {
                "args" => list = Some(List::Args),
                "returns" => list = Some(List::Returns),
                "file" => {
                    list = None;
                    match rest.next() {
                        Some((Token::Str(s), _)) => file = s.clone(),
                        other => return Err(unexpected(other, "a quoted file name", *at)),
                    }
                }
                "method" => flags = flags | FunctionFlags::METHOD,
                "action" => flags = flags | FunctionFlags::METHOD | FunctionFlags::ACTION,
                "static" => flags = flags | FunctionFlags::STATIC,
                "abstract" => flags = flags | FunctionFlags::ABSTRACT,
                "unsafe" => flags = flags | FunctionFlags::UNSAFE,
                "side" => {
                    list = None;
                    side = match rest.next() {
                        Some((Token::Ident(s), at)) => Side::parse(s).ok_or_else(|| {
                            syntax(*at, format!("unknown side `{s}`"))
                                .with_hint("sides are data, ui, play, virtual and clearscope")
                        })?,
                        other => return Err(unexpected(other, "a side name", *at)),
                    };
                    if side == Side::Virtual {
                        flags = flags | FunctionFlags::VIRTUAL_SCOPE;
                    }
                }
                ty => match (list, header_type(ty)) {
                    (Some(List::Args), Some((tag, slots))) => {
                        proto.args.extend(std::iter::repeat_n(tag & REGT_TYPE, slots));
                    }
                    (Some(List::Returns), Some((tag, _))) => proto.returns.push(tag),
                    _ => {
                        return Err(syntax(*at, format!("unexpected `{ty}` in function header")).with_hint(
                            "header words are args, returns, file, method, action, static, abstract, unsafe and side",
                        ));
                    }
                },
            }
        }
        let func = Arc::new(Function::script(name, flags, proto).with_side(side));
        Ok(Header { line: line_index, func, file, span })
    }

    // ── Pass 2 ──────────────────────────────────────────────────────

    fn define(&self, lines: &[&[Spanned]], headers: &[Header]) -> Result<(), AsmError> {
        let mut pending = headers.iter().peekable();
        let mut body: Option<Body> = None;
        for (i, line) in lines.iter().enumerate() {
            match &line[0].0 {
                Token::Directive(d) if d == "func" => {
                    body = pending.next_if(|h| h.line == i).map(Body::new);
                }
                Token::Directive(d) if d == "end" => {
                    if let Some(b) = body.take() {
                        b.finish()?;
                    }
                }
                Token::Directive(d) if d == "line" => {
                    let n = match line.get(1) {
                        Some((Token::Int(n), at)) => int_in::<u32>(*n, *at)?,
                        other => return Err(unexpected(other, "a line number", line_span(line))),
                    };
                    if let Some(b) = body.as_mut() {
                        b.code.begin_statement(n);
                    }
                }
                Token::Directive(_) => {}
                _ => {
                    if let Some(b) = body.as_mut() {
                        self.statement(b, line)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn statement(&self, body: &mut Body, line: &[Spanned]) -> Result<(), AsmError> {
        let mut rest = line;
        if let [(Token::Ident(name), span), (Token::Colon, _), tail @ ..] = line {
            body.label(name, *span)?;
            rest = tail;
        }
        let Some(((first, span), tail)) = rest.split_first() else {
            return Ok(());
        };
        let Token::Ident(mnemonic) = first else {
            return Err(unexpected(Some(&(first.clone(), *span)), "an instruction", *span));
        };
        let (approx, tail) = match tail {
            [(Token::Tilde, _), tail @ ..] => (true, tail),
            _ => (false, tail),
        };
        let args = operands(tail, *span)?;
        for item in &args {
            body.touch(&item.arg);
        }
        let span = line_span(rest);
        if approx {
            return match self.branch(body, mnemonic, span, true, &args)? {
                true => Ok(()),
                false => Err(syntax(span, format!("`{mnemonic}` has no approximate form"))),
            };
        }
        match mnemonic.as_str() {
            "jmp" => match args.as_slice() {
                [target] => body.jump_to(target),
                _ => Err(arity(mnemonic, span, "label")),
            },
            "param" => self.param(body, span, &args),
            "parami" => match args.as_slice() {
                [Item { arg: Arg::Int(v), span: at }] => {
                    body.code.emit_i24(OP_PARAMI, int_in(*v, *at)?).map_err(encoding(*at))?;
                    Ok(())
                }
                _ => Err(arity(mnemonic, span, "imm")),
            },
            "result" => match args.as_slice() {
                [Item { arg: Arg::Reg(r), .. }] => {
                    body.code.emit_abx(OP_RESULT, r.flags(), r.index as u16);
                    Ok(())
                }
                _ => Err(arity(mnemonic, span, "register")),
            },
            "ret" => self.ret(body, span, &args),
            "reti" => self.reti(body, span, &args),
            "cast" => self.cast(body, span, &args),
            "castb" => self.castb(body, span, &args),
            "flop" => self.flop(body, span, &args),
            "scope" => self.scope(body, span, &args),
            _ => {
                if self.branch(body, mnemonic, span, false, &args)? {
                    Ok(())
                } else {
                    self.generic(body, mnemonic, span, &args)
                }
            }
        }
    }

    // ── Operand encoding ────────────────────────────────────────────

    fn address(&self, name: Option<&str>, span: Span) -> Result<AddressConst, AsmError> {
        let Some(name) = name else {
            return Ok(AddressConst::Null);
        };
        self.names.get(name).map(|f| AddressConst::Function(f.clone())).ok_or_else(|| {
            AsmError::new(codes::UNDEFINED, span, format!("unknown function `{name}`"))
                .with_hint("declare it with `.func` or import it with `.native`")
        })
    }

    /// Raw field value for `item` read as `kind`. Pool indices that do not
    /// fit an 8-bit field are rejected.
    fn encode(&self, code: &mut CodeBuilder, kind: Operand, item: &Item) -> Result<u16, AsmError> {
        let span = item.span;
        let pooled = |r: Result<u16, BuildError>| r.map_err(encoding(span));
        let index = match (&item.arg, kind) {
            (Arg::Reg(r), _) => return Ok(r.index as u16),
            (Arg::KInt(v) | Arg::Int(v), Operand::IntKonst | Operand::JointIntKonst) => {
                pooled(code.konst_int(int_in(*v, span)?))?
            }
            (Arg::KInt(v), _) => pooled(code.konst_float(*v as f64))?,
            (Arg::KFloat(v) | Arg::Float(v), _) => pooled(code.konst_float(*v))?,
            (Arg::KStr(s), _) => pooled(code.konst_string(s))?,
            (Arg::Address(name), _) => pooled(code.konst_address(self.address(name.as_deref(), span)?))?,
            (Arg::Word(name), _) => pooled(code.konst_address(self.address(Some(name), span)?))?,
            (Arg::Int(v), Operand::Imm) => return Ok(int_in::<i8>(*v, span)? as u8 as u16),
            (Arg::Int(v), Operand::UImm | Operand::CmpFlags) => return Ok(int_in::<u8>(*v, span)? as u16),
            (Arg::Int(v), Operand::JointImm) => return Ok(int_in::<i16>(*v, span)? as u16),
            (Arg::Int(v), _) => return int_in::<u16>(*v, span),
            _ => return Err(AsmError::new(codes::OPERAND, span, "operand does not fit here")),
        };
        if !kind.is_joint() && index > u8::MAX as u16 {
            return Err(AsmError::new(
                codes::ENCODING,
                span,
                format!("constant #{index} cannot be encoded in an 8-bit operand"),
            )
            .with_hint("use the register form and load the constant first"));
        }
        Ok(index)
    }

    fn emit_shaped(&self, body: &mut Body, op: u8, args: &[Item]) -> Result<(), AsmError> {
        let info = &OP_INFO[op as usize];
        let mut fields = [0u16; 3];
        for (field, (kind, item)) in fields.iter_mut().zip(shape(info).into_iter().zip(args)) {
            *field = self.encode(&mut body.code, kind, item)?;
        }
        if info.mode.b.is_joint() {
            body.code.emit_abx(op, fields[0] as u8, fields[1]);
        } else {
            body.code.emit(op, fields[0] as u8, fields[1] as u8, fields[2] as u8);
        }
        Ok(())
    }

    /// Table-driven instructions, falling back to the constant or immediate
    /// alternate when the last operand is not a register.
    fn generic(&self, body: &mut Body, mnemonic: &str, span: Span, args: &[Item]) -> Result<(), AsmError> {
        let op = lookup(mnemonic).ok_or_else(|| {
            AsmError::new(codes::UNKNOWN_INSTRUCTION, span, format!("unknown instruction `{mnemonic}`"))
        })?;
        let info = &OP_INFO[op as usize];
        if shape(info).contains(&Operand::Variable) || info.mode.a == Operand::Imm24 {
            return Err(AsmError::new(codes::OPERAND, span, format!("`{mnemonic}` cannot be written directly"))
                .with_hint("use the branch pseudo-instructions"));
        }
        let mut candidate = Some(op);
        while let Some(op) = candidate {
            let info = &OP_INFO[op as usize];
            let kinds = shape(info);
            if kinds.len() == args.len() && kinds.iter().zip(args).all(|(k, item)| fits(*k, &item.arg)) {
                return self.emit_shaped(body, op, args);
            }
            candidate = info.alt;
        }
        let form: Vec<&str> = shape(info).into_iter().map(spelling).collect();
        Err(AsmError::new(codes::OPERAND, span, format!("operands do not fit `{mnemonic}`"))
            .with_hint(format!("expected `{mnemonic} {}`", form.join(", "))))
    }

    /// Fused compare-and-jump pseudo-instructions. Returns false when
    /// `mnemonic` is not a branch.
    fn branch(&self, body: &mut Body, mnemonic: &str, span: Span, approx: bool, args: &[Item]) -> Result<bool, AsmError> {
        if let Some(&(_, method, check)) = STRING_BRANCHES.iter().find(|b| b.0 == mnemonic) {
            let [lhs, rhs, target] = args else {
                return Err(arity(mnemonic, span, "s1, s2, label"));
            };
            let mut flags = method | if check { CMP_CHECK } else { 0 } | if approx { CMP_APPROX } else { 0 };
            let mut side = |item: &Item, konst_flag: u8| -> Result<u8, AsmError> {
                match &item.arg {
                    Arg::Reg(r) if r.bank == Bank::String && r.width == 1 => Ok(r.index),
                    Arg::KStr(_) => {
                        flags |= konst_flag;
                        Ok(self.encode(&mut body.code, Operand::StringKonst, item)? as u8)
                    }
                    _ => Err(AsmError::new(codes::OPERAND, item.span, "expected a string register or constant")),
                }
            };
            let b = side(lhs, CMP_BK)?;
            let c = side(rhs, CMP_CK)?;
            body.code.emit(OP_CMPS, flags, b, c);
            body.jump_to(target)?;
            return Ok(true);
        }

        let candidates: Vec<(u8, bool)> = OP_INFO
            .iter()
            .enumerate()
            .filter_map(|(i, info)| match info.branch {
                Some((t, _)) if t == mnemonic => Some((i as u8, true)),
                Some((_, f)) if f == mnemonic => Some((i as u8, false)),
                _ => None,
            })
            .collect();
        if candidates.is_empty() {
            return Ok(false);
        }
        let [lhs, rhs, target] = args else {
            return Err(arity(mnemonic, span, "lhs, rhs, label"));
        };
        let (op, check) = candidates
            .iter()
            .copied()
            .find(|&(op, _)| {
                let mode = OP_INFO[op as usize].mode;
                fits(mode.b, &lhs.arg) && fits(mode.c, &rhs.arg)
            })
            .ok_or_else(|| AsmError::new(codes::OPERAND, span, format!("operands do not fit `{mnemonic}`")))?;
        let mode = OP_INFO[op as usize].mode;
        if approx && !matches!(mode.b, Operand::FloatReg | Operand::FloatKonst | Operand::Vec2Reg | Operand::Vec3Reg) {
            return Err(syntax(span, format!("`{mnemonic}` has no approximate form")));
        }
        let flags = if check { CMP_CHECK } else { 0 } | if approx { CMP_APPROX } else { 0 };
        let b = self.encode(&mut body.code, mode.b, lhs)? as u8;
        let c = self.encode(&mut body.code, mode.c, rhs)? as u8;
        body.code.emit(op, flags, b, c);
        body.jump_to(target)?;
        Ok(true)
    }

    // ── Special shapes ──────────────────────────────────────────────

    /// Flags and index for a typed operand of PARAM and RET.
    fn typed(&self, code: &mut CodeBuilder, item: &Item, allow_addrof: bool) -> Result<(u8, u16), AsmError> {
        let span = item.span;
        let pooled = |r: Result<u16, BuildError>| r.map_err(encoding(span));
        Ok(match &item.arg {
            Arg::Reg(r) => (r.flags(), r.index as u16),
            Arg::AddrOf(r) if allow_addrof => (r.flags() | REGT_ADDROF, r.index as u16),
            Arg::KInt(v) => (REGT_INT | REGT_KONST, pooled(code.konst_int(int_in(*v, span)?))?),
            Arg::KFloat(v) | Arg::Float(v) => (REGT_FLOAT | REGT_KONST, pooled(code.konst_float(*v))?),
            Arg::KStr(s) => (REGT_STRING | REGT_KONST, pooled(code.konst_string(s))?),
            Arg::Address(name) => {
                (REGT_POINTER | REGT_KONST, pooled(code.konst_address(self.address(name.as_deref(), span)?))?)
            }
            _ => return Err(AsmError::new(codes::OPERAND, span, "expected a register or constant")),
        })
    }

    fn param(&self, body: &mut Body, span: Span, args: &[Item]) -> Result<(), AsmError> {
        let [item] = args else {
            return Err(arity("param", span, "operand"));
        };
        if let Arg::Int(v) = item.arg {
            body.code.emit_param_int(int_in(v, item.span)?).map_err(encoding(item.span))?;
            return Ok(());
        }
        let (flags, index) = self.typed(&mut body.code, item, true)?;
        body.code.emit_abx(OP_PARAM, flags, index);
        Ok(())
    }

    /// `final` suffix of RET and RETI.
    fn final_bit(rest: &[Item]) -> Result<u8, AsmError> {
        match rest {
            [] => Ok(0),
            [item] if item.arg == Arg::Word("final".into()) => Ok(RET_FINAL),
            [item, ..] => Err(AsmError::new(codes::OPERAND, item.span, "expected `final`")),
        }
    }

    fn ret(&self, body: &mut Body, span: Span, args: &[Item]) -> Result<(), AsmError> {
        match args {
            [item] if item.arg == Arg::Word("void".into()) => {
                body.code.emit(OP_RET, RET_FINAL, REGT_NIL, 0);
                Ok(())
            }
            [slot, value, rest @ ..] => {
                let Arg::Int(n) = slot.arg else {
                    return Err(AsmError::new(codes::OPERAND, slot.span, "expected a return slot number"));
                };
                let n: u8 = int_in(n, slot.span)?;
                if n >= RET_FINAL {
                    return Err(AsmError::new(codes::OPERAND, slot.span, "return slot out of range"));
                }
                let (flags, index) = self.typed(&mut body.code, value, false)?;
                let index = u8::try_from(index).map_err(|_| {
                    AsmError::new(codes::ENCODING, value.span, "returned constant index exceeds 8 bits")
                })?;
                body.code.emit(OP_RET, n | Self::final_bit(rest)?, flags, index);
                Ok(())
            }
            _ => Err(arity("ret", span, "slot, operand[, final]` or `ret void")),
        }
    }

    fn reti(&self, body: &mut Body, span: Span, args: &[Item]) -> Result<(), AsmError> {
        let [slot, value, rest @ ..] = args else {
            return Err(arity("reti", span, "slot, imm[, final]"));
        };
        let (Arg::Int(n), Arg::Int(v)) = (&slot.arg, &value.arg) else {
            return Err(arity("reti", span, "slot, imm[, final]"));
        };
        let n: u8 = int_in(*n, slot.span)?;
        if n >= RET_FINAL {
            return Err(AsmError::new(codes::OPERAND, slot.span, "return slot out of range"));
        }
        let v: i16 = int_in(*v, value.span)?;
        body.code.emit_abx(OP_RETI, n | Self::final_bit(rest)?, v as u16);
        Ok(())
    }

    fn cast(&self, body: &mut Body, span: Span, args: &[Item]) -> Result<(), AsmError> {
        let [dst, src, kind] = args else {
            return Err(arity("cast", span, "dst, src, kind"));
        };
        let name = word(kind)?;
        let (code, _, dst_kind, src_kind) = CASTS.iter().find(|c| c.1 == name).ok_or_else(|| {
            let names: Vec<&str> = CASTS.iter().map(|c| c.1).collect();
            AsmError::new(codes::OPERAND, kind.span, format!("unknown cast `{name}`"))
                .with_hint(format!("casts are {}", names.join(", ")))
        })?;
        if !fits(*dst_kind, &dst.arg) || !fits(*src_kind, &src.arg) {
            return Err(AsmError::new(codes::OPERAND, span, format!("registers do not fit cast `{name}`"))
                .with_hint(format!("expected `cast {}, {}, {name}`", spelling(*dst_kind), spelling(*src_kind))));
        }
        let a = self.encode(&mut body.code, *dst_kind, dst)? as u8;
        let b = self.encode(&mut body.code, *src_kind, src)? as u8;
        body.code.emit(OP_CAST, a, b, *code);
        Ok(())
    }

    /// `castb d0, f1` with the kind taken from the source bank, or spelled
    /// out as a third operand.
    fn castb(&self, body: &mut Body, span: Span, args: &[Item]) -> Result<(), AsmError> {
        let (dst, src, kind) = match args {
            [dst, src] => (dst, src, None),
            [dst, src, kind] => (dst, src, Some(kind)),
            _ => return Err(arity("castb", span, "dN, src[, i|f|a|s]")),
        };
        let kind = match kind {
            Some(item) => {
                let name = word(item)?;
                CASTB_NAMES.iter().position(|n| *n == name).ok_or_else(|| {
                    AsmError::new(codes::OPERAND, item.span, format!("unknown bool cast `{name}`"))
                })? as u8
            }
            None => match &src.arg {
                Arg::Reg(r) => match r.bank {
                    Bank::Int => CASTB_I,
                    Bank::Float => CASTB_F,
                    Bank::Pointer => CASTB_A,
                    Bank::String => CASTB_S,
                },
                _ => return Err(AsmError::new(codes::OPERAND, src.span, "expected a register")),
            },
        };
        let src_kind = castb_source(kind).unwrap_or(Operand::IntReg);
        if !fits(Operand::IntReg, &dst.arg) || !fits(src_kind, &src.arg) {
            return Err(AsmError::new(codes::OPERAND, span, "operands do not fit `castb`"));
        }
        let a = self.encode(&mut body.code, Operand::IntReg, dst)? as u8;
        let b = self.encode(&mut body.code, src_kind, src)? as u8;
        body.code.emit(OP_CASTB, a, b, kind);
        Ok(())
    }

    fn flop(&self, body: &mut Body, span: Span, args: &[Item]) -> Result<(), AsmError> {
        let [dst, src, func] = args else {
            return Err(arity("flop", span, "fN, fN, name"));
        };
        let code = match &func.arg {
            Arg::Word(name) => FLOP_NAMES.iter().position(|n| *n == name.as_str()).ok_or_else(|| {
                AsmError::new(codes::OPERAND, func.span, format!("unknown float function `{name}`"))
            })? as u8,
            Arg::Int(v) => int_in(*v, func.span)?,
            _ => return Err(AsmError::new(codes::OPERAND, func.span, "expected a float function name")),
        };
        if !fits(Operand::FloatReg, &dst.arg) || !fits(Operand::FloatReg, &src.arg) {
            return Err(arity("flop", span, "fN, fN, name"));
        }
        let a = self.encode(&mut body.code, Operand::FloatReg, dst)? as u8;
        let b = self.encode(&mut body.code, Operand::FloatReg, src)? as u8;
        body.code.emit(OP_FLOP, a, b, code);
        Ok(())
    }

    fn scope(&self, body: &mut Body, span: Span, args: &[Item]) -> Result<(), AsmError> {
        let [object, side, func] = args else {
            return Err(arity("scope", span, "aN, side, @func"));
        };
        let side = match &side.arg {
            Arg::Word(name) => Side::parse(name)
                .ok_or_else(|| AsmError::new(codes::OPERAND, side.span, format!("unknown side `{name}`")))?
                as u8,
            Arg::Int(v) => int_in(*v, side.span)?,
            _ => return Err(AsmError::new(codes::OPERAND, side.span, "expected a side name")),
        };
        if !fits(Operand::PointerReg, &object.arg) || !fits(Operand::PointerKonst, &func.arg) {
            return Err(arity("scope", span, "aN, side, @func"));
        }
        let a = self.encode(&mut body.code, Operand::PointerReg, object)? as u8;
        let c = self.encode(&mut body.code, Operand::PointerKonst, func)? as u8;
        body.code.emit(OP_SCOPE, a, side, c);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::asm::{assemble, codes};
    use crate::vm::abort::AbortReason;
    use crate::vm::disasm::disassemble;
    use crate::vm::opcodes::*;
    use crate::vm::value::Value;
    use crate::vm::{Vm, VmConfig};

    fn run(src: &str, args: &[Value]) -> Result<Vec<Value>, crate::vm::abort::Abort> {
        let module = assemble(src, &[]).unwrap();
        let vm = Vm::new(VmConfig::interpreted());
        let mut stack = vm.new_stack();
        vm.call_values(&mut stack, module.first().unwrap(), args)
    }

    #[test]
    fn assembles_header_and_body() {
        let src = ".func add5 args d returns d file \"demo.zs\"\n.line 3\n    add_ri d0, d0, 5\n    ret 0, d0, final\n.end\n";
        let module = assemble(src, &[]).unwrap();
        let f = module.get("add5").unwrap();
        assert_eq!(f.proto.args, vec![REGT_INT]);
        assert_eq!(f.proto.returns, vec![REGT_INT]);
        let body = f.body().unwrap();
        assert_eq!(body.source_file(), Some("demo.zs"));
        assert_eq!(body.pc_to_line(0), Some(3));
        assert_eq!(body.counts.int, 1);
        assert_eq!(run(src, &[Value::Int(10)]).unwrap(), vec![Value::Int(15)]);
    }

    #[test]
    fn konst_operand_switches_to_alternate_form() {
        let src = ".func f args d returns d\n    add_rr d1, d0, #1000\n    ret 0, d1, final\n.end\n";
        let module = assemble(src, &[]).unwrap();
        let body = module.first().unwrap().body().unwrap();
        assert_eq!(body.code[0].opcode(), OP_ADD_RK);
        assert_eq!(body.konst_int, vec![1000]);
        assert_eq!(body.counts.int, 2);
    }

    #[test]
    fn pseudo_branches_and_labels() {
        let src = "\
.func max args d d returns d
    blt d0, d1, second
    ret 0, d0, final
second:
    ret 0, d1, final
.end
";
        assert_eq!(run(src, &[Value::Int(3), Value::Int(9)]).unwrap(), vec![Value::Int(9)]);
        assert_eq!(run(src, &[Value::Int(12), Value::Int(9)]).unwrap(), vec![Value::Int(12)]);
        let module = assemble(src, &[]).unwrap();
        let code = &module.first().unwrap().body().unwrap().code;
        assert_eq!(code[0].opcode(), OP_LT_RR);
        assert_eq!(code[0].a(), CMP_CHECK);
        assert_eq!(code[1].opcode(), OP_JMP);
        assert_eq!(code[1].jump_target(1), 3);
    }

    #[test]
    fn string_branch_with_constant_and_approx_float_branch() {
        let src = "\
.func pick args s f returns d
    beqs s0, #\"yes\", matched
    beqf~ f0, #1.0, close
    reti 0, 0, final
matched:
    reti 0, 1, final
close:
    reti 0, 2, final
.end
";
        let yes = run(src, &[Value::String("yes".into()), Value::Float(0.0)]).unwrap();
        assert_eq!(yes, vec![Value::Int(1)]);
        let near = run(src, &[Value::String("no".into()), Value::Float(1.0 + 1e-7)]).unwrap();
        assert_eq!(near, vec![Value::Int(2)]);
        let far = run(src, &[Value::String("no".into()), Value::Float(2.0)]).unwrap();
        assert_eq!(far, vec![Value::Int(0)]);
    }

    #[test]
    fn calls_resolve_forward_references() {
        let src = "\
.func outer args d returns d
    param d0
    param #2
    call_k @inner, 2, 1
    result d1
    ret 0, d1, final
.end
.func inner args d d returns d
    mul_rr d0, d0, d1
    ret 0, d0, final
.end
";
        assert_eq!(run(src, &[Value::Int(21)]).unwrap(), vec![Value::Int(42)]);
    }

    #[test]
    fn throw_carries_its_message() {
        let src = ".func boom\n    throw 0, #\"kaboom\"\n.end\n";
        let err = run(src, &[]).unwrap_err();
        assert_eq!(err.reason, AbortReason::Other);
        assert_eq!(err.message.as_deref(), Some("kaboom"));
    }

    #[test]
    fn cast_and_flop_by_name() {
        let src = "\
.func root args d returns d
    cast f0, d0, i2f
    flop f1, f0, sqrt
    cast d1, f1, f2i
    ret 0, d1, final
.end
";
        assert_eq!(run(src, &[Value::Int(49)]).unwrap(), vec![Value::Int(7)]);
        let module = assemble(src, &[]).unwrap();
        let text = disassemble(module.first().unwrap());
        assert!(text.contains("flop      f1, f0, sqrt"), "{text}");
    }

    #[test]
    fn vector_groups_size_the_float_bank() {
        let src = "\
.func len3 args v3 returns f
    lenv3 f3, f0:3
    ret 0, f3, final
.end
";
        let module = assemble(src, &[]).unwrap();
        let f = module.first().unwrap();
        assert_eq!(f.proto.args.len(), 3);
        assert_eq!(f.body().unwrap().counts.float, 4);
        let out = run(src, &[Value::Float(2.0), Value::Float(3.0), Value::Float(6.0)]).unwrap();
        assert_eq!(out, vec![Value::Float(7.0)]);
    }

    #[test]
    fn errors_carry_codes_and_spans() {
        let err = assemble(".func f\n    frob d0\n.end\n", &[]).unwrap_err();
        assert_eq!(err.code, codes::UNKNOWN_INSTRUCTION);
        assert_eq!(err.span.start, 12);

        let err = assemble(".func f\n    jmp nowhere\n.end\n", &[]).unwrap_err();
        assert_eq!(err.code, codes::UNDEFINED);

        let err = assemble(".func f\n    add_ri d0, d0, s1\n.end\n", &[]).unwrap_err();
        assert_eq!(err.code, codes::OPERAND);
        assert!(err.hint.unwrap().contains("add_ri dN, dN, imm"));

        let err = assemble(".func f\n.end\n.func f\n.end\n", &[]).unwrap_err();
        assert_eq!(err.code, codes::DUPLICATE);

        let err = assemble(".func f\n    li d0, 1\n.end\n", &[]).unwrap_err();
        assert_eq!(err.code, codes::VERIFY);

        let err = assemble(".native nothing_here\n", &[]).unwrap_err();
        assert_eq!(err.code, codes::UNDEFINED);

        let err = assemble("    nop\n", &[]).unwrap_err();
        assert_eq!(err.code, codes::SYNTAX);

        let err = assemble(".func f\n    nop\n", &[]).unwrap_err();
        assert_eq!(err.code, codes::SYNTAX);
    }
}
