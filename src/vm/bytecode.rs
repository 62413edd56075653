//! Decoded method bodies handed to the compiler by the interpreter.
//!
//! Class-file parsing and constant-pool resolution happen elsewhere; the
//! compiler only sees already-decoded instructions with resolved branch
//! targets (bytecode indices into `Method::code`) and resolved constants.
//!
//! Instructions have a textual mnemonic form (`"iload 0"`, `"if_icmplt 7"`)
//! so that methods can be written down in TOML files.

use super::heap::ObjectRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Error type for reading method descriptions.
#[derive(Debug, thiserror::Error)]
pub enum MethodParseError {
    #[error("unknown instruction `{0}`")]
    UnknownInstruction(String),
    #[error("instruction `{text}`: {reason}")]
    BadOperand { text: String, reason: String },
    #[error("bci {bci}: {reason}")]
    Invalid { bci: usize, reason: String },
    #[error("method header: {0}")]
    Header(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse method file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Java value kinds as the compiler sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BasicType {
    Int,
    Long,
    Float,
    Double,
    Object,
    Void,
}

impl BasicType {
    /// `long` and `double` occupy two stack/local slots.
    pub fn is_two_word(self) -> bool {
        matches!(self, BasicType::Long | BasicType::Double)
    }

    pub fn is_float(self) -> bool {
        matches!(self, BasicType::Float | BasicType::Double)
    }

    /// Number of slots a value of this type occupies.
    pub fn word_size(self) -> usize {
        match self {
            BasicType::Void => 0,
            BasicType::Long | BasicType::Double => 2,
            _ => 1,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            BasicType::Int => "i",
            BasicType::Long => "l",
            BasicType::Float => "f",
            BasicType::Double => "d",
            BasicType::Object => "a",
            BasicType::Void => "",
        }
    }

    fn from_prefix(c: char) -> Option<Self> {
        match c {
            'i' => Some(BasicType::Int),
            'l' => Some(BasicType::Long),
            'f' => Some(BasicType::Float),
            'd' => Some(BasicType::Double),
            'a' => Some(BasicType::Object),
            _ => None,
        }
    }
}

impl fmt::Display for BasicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BasicType::Int => "int",
            BasicType::Long => "long",
            BasicType::Float => "float",
            BasicType::Double => "double",
            BasicType::Object => "object",
            BasicType::Void => "void",
        };
        f.write_str(name)
    }
}

impl FromStr for BasicType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int" => Ok(BasicType::Int),
            "long" => Ok(BasicType::Long),
            "float" => Ok(BasicType::Float),
            "double" => Ok(BasicType::Double),
            "object" => Ok(BasicType::Object),
            "void" => Ok(BasicType::Void),
            other => Err(format!("unknown type `{}`", other)),
        }
    }
}

/// Binary operators with a compiled template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
}

impl ArithOp {
    fn name(self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
            ArithOp::And => "and",
            ArithOp::Or => "or",
            ArithOp::Xor => "xor",
        }
    }

    fn from_name(s: &str) -> Option<Self> {
        match s {
            "add" => Some(ArithOp::Add),
            "sub" => Some(ArithOp::Sub),
            "mul" => Some(ArithOp::Mul),
            "div" => Some(ArithOp::Div),
            "and" => Some(ArithOp::And),
            "or" => Some(ArithOp::Or),
            "xor" => Some(ArithOp::Xor),
            _ => None,
        }
    }
}

/// Branch conditions, for both `if<cond>` (against zero) and `if_icmp<cond>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl BranchCond {
    fn name(self) -> &'static str {
        match self {
            BranchCond::Eq => "eq",
            BranchCond::Ne => "ne",
            BranchCond::Lt => "lt",
            BranchCond::Ge => "ge",
            BranchCond::Gt => "gt",
            BranchCond::Le => "le",
        }
    }

    fn from_name(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(BranchCond::Eq),
            "ne" => Some(BranchCond::Ne),
            "lt" => Some(BranchCond::Lt),
            "ge" => Some(BranchCond::Ge),
            "gt" => Some(BranchCond::Gt),
            "le" => Some(BranchCond::Le),
            _ => None,
        }
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
#[allow(clippy::enum_variant_names)]
pub enum Bytecode {
    IConst(i32),
    LConst(i64),
    FConst(f32),
    DConst(f64),
    AConstNull,
    /// Push constant-pool entry `n`.
    Ldc(u16),
    Load(BasicType, u16),
    Store(BasicType, u16),
    /// `iinc local, delta`
    IInc(u16, i32),
    /// Typed binary arithmetic (`iadd`, `lsub`, `fmul`, ...).
    Arith(BasicType, ArithOp),
    INeg,
    Pop,
    Pop2,
    Dup,
    DupX1,
    Dup2,
    Swap,
    /// Compare the int on top of stack against zero and branch.
    If(BranchCond, usize),
    /// Compare two ints and branch.
    IfICmp(BranchCond, usize),
    Goto(usize),
    /// Static call: parameter block size in slots, and the result type.
    InvokeStatic {
        method: u16,
        parameter_slots: u16,
        returns: BasicType,
    },
    Return(BasicType),
    /// Any opcode the compiler has no template for.
    Other(u8),
}

impl Bytecode {
    /// Branch target, if this instruction can transfer control.
    pub fn branch_target(&self) -> Option<usize> {
        match *self {
            Bytecode::If(_, t) | Bytecode::IfICmp(_, t) | Bytecode::Goto(t) => Some(t),
            _ => None,
        }
    }

    /// Whether execution never falls through to the next instruction.
    pub fn ends_block(&self) -> bool {
        matches!(self, Bytecode::Goto(_) | Bytecode::Return(_))
    }

    /// Mnemonic for an otherwise unsupported opcode.
    fn other_name(opcode: u8) -> Option<&'static str> {
        OTHER_OPCODES
            .iter()
            .find(|(_, op)| *op == opcode)
            .map(|(name, _)| *name)
    }
}

/// Opcodes recognized by name but never compiled.
const OTHER_OPCODES: &[(&str, u8)] = &[
    ("lmul", 0x69),
    ("idiv", 0x6c),
    ("irem", 0x70),
    ("lcmp", 0x94),
    ("fcmpl", 0x95),
    ("dcmpl", 0x97),
    ("getfield", 0xb4),
    ("putfield", 0xb5),
    ("invokevirtual", 0xb6),
    ("new", 0xbb),
    ("arraylength", 0xbe),
    ("athrow", 0xbf),
    ("monitorenter", 0xc2),
    ("monitorexit", 0xc3),
];

impl fmt::Display for Bytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Bytecode::IConst(v) => write!(f, "iconst {}", v),
            Bytecode::LConst(v) => write!(f, "lconst {}", v),
            Bytecode::FConst(v) => write!(f, "fconst {:?}", v),
            Bytecode::DConst(v) => write!(f, "dconst {:?}", v),
            Bytecode::AConstNull => write!(f, "aconst_null"),
            Bytecode::Ldc(n) => write!(f, "ldc {}", n),
            Bytecode::Load(t, n) => write!(f, "{}load {}", t.prefix(), n),
            Bytecode::Store(t, n) => write!(f, "{}store {}", t.prefix(), n),
            Bytecode::IInc(n, d) => write!(f, "iinc {} {}", n, d),
            Bytecode::Arith(t, op) => write!(f, "{}{}", t.prefix(), op.name()),
            Bytecode::INeg => write!(f, "ineg"),
            Bytecode::Pop => write!(f, "pop"),
            Bytecode::Pop2 => write!(f, "pop2"),
            Bytecode::Dup => write!(f, "dup"),
            Bytecode::DupX1 => write!(f, "dup_x1"),
            Bytecode::Dup2 => write!(f, "dup2"),
            Bytecode::Swap => write!(f, "swap"),
            Bytecode::If(c, t) => write!(f, "if{} {}", c.name(), t),
            Bytecode::IfICmp(c, t) => write!(f, "if_icmp{} {}", c.name(), t),
            Bytecode::Goto(t) => write!(f, "goto {}", t),
            Bytecode::InvokeStatic {
                method,
                parameter_slots,
                returns,
            } => write!(f, "invokestatic {} {} {}", method, parameter_slots, returns),
            Bytecode::Return(BasicType::Void) => write!(f, "return"),
            Bytecode::Return(t) => write!(f, "{}return", t.prefix()),
            Bytecode::Other(op) => match Bytecode::other_name(op) {
                Some(name) => f.write_str(name),
                None => write!(f, "raw {:#04x}", op),
            },
        }
    }
}

fn operand<T: FromStr>(text: &str, parts: &[&str], index: usize) -> Result<T, MethodParseError>
where
    T::Err: fmt::Display,
{
    let raw = parts.get(index).ok_or_else(|| MethodParseError::BadOperand {
        text: text.to_string(),
        reason: format!("missing operand {}", index),
    })?;
    raw.parse::<T>().map_err(|e| MethodParseError::BadOperand {
        text: text.to_string(),
        reason: e.to_string(),
    })
}

impl FromStr for Bytecode {
    type Err = MethodParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = text.split_whitespace().collect();
        let Some(&name) = parts.first() else {
            return Err(MethodParseError::UnknownInstruction(text.to_string()));
        };

        let expected_operands = |n: usize| -> Result<(), MethodParseError> {
            if parts.len() != n + 1 {
                return Err(MethodParseError::BadOperand {
                    text: text.to_string(),
                    reason: format!("expected {} operand(s), found {}", n, parts.len() - 1),
                });
            }
            Ok(())
        };

        let op = match name {
            "iconst" => Bytecode::IConst(operand(text, &parts, 1)?),
            "lconst" => Bytecode::LConst(operand(text, &parts, 1)?),
            "fconst" => Bytecode::FConst(operand(text, &parts, 1)?),
            "dconst" => Bytecode::DConst(operand(text, &parts, 1)?),
            "aconst_null" => Bytecode::AConstNull,
            "ldc" => Bytecode::Ldc(operand(text, &parts, 1)?),
            "iinc" => Bytecode::IInc(operand(text, &parts, 1)?, operand(text, &parts, 2)?),
            "ineg" => Bytecode::INeg,
            "pop" => Bytecode::Pop,
            "pop2" => Bytecode::Pop2,
            "dup" => Bytecode::Dup,
            "dup_x1" => Bytecode::DupX1,
            "dup2" => Bytecode::Dup2,
            "swap" => Bytecode::Swap,
            "goto" => Bytecode::Goto(operand(text, &parts, 1)?),
            "return" => Bytecode::Return(BasicType::Void),
            "invokestatic" => Bytecode::InvokeStatic {
                method: operand(text, &parts, 1)?,
                parameter_slots: operand(text, &parts, 2)?,
                returns: operand(text, &parts, 3)?,
            },
            "raw" => {
                let raw: &str = parts.get(1).copied().unwrap_or("");
                let value = u8::from_str_radix(raw.trim_start_matches("0x"), 16).map_err(|e| {
                    MethodParseError::BadOperand {
                        text: text.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Bytecode::Other(value)
            }
            _ => {
                if let Some(&(_, opcode)) = OTHER_OPCODES.iter().find(|(n, _)| *n == name) {
                    Bytecode::Other(opcode)
                } else if let Some(cond) = name.strip_prefix("if_icmp").and_then(BranchCond::from_name)
                {
                    Bytecode::IfICmp(cond, operand(text, &parts, 1)?)
                } else if let Some(cond) = name.strip_prefix("if").and_then(BranchCond::from_name) {
                    Bytecode::If(cond, operand(text, &parts, 1)?)
                } else {
                    let mut chars = name.chars();
                    let kind = chars.next().and_then(BasicType::from_prefix);
                    let rest = chars.as_str();
                    match (kind, rest) {
                        (Some(t), "load") => Bytecode::Load(t, operand(text, &parts, 1)?),
                        (Some(t), "store") => Bytecode::Store(t, operand(text, &parts, 1)?),
                        (Some(t), "return") => Bytecode::Return(t),
                        (Some(t), op) if t != BasicType::Object => match ArithOp::from_name(op) {
                            Some(op) => Bytecode::Arith(t, op),
                            None => return Err(MethodParseError::UnknownInstruction(text.to_string())),
                        },
                        _ => return Err(MethodParseError::UnknownInstruction(text.to_string())),
                    }
                }
            }
        };

        let operands = match op {
            Bytecode::IInc(..) => 2,
            Bytecode::InvokeStatic { .. } => 3,
            Bytecode::IConst(_)
            | Bytecode::LConst(_)
            | Bytecode::FConst(_)
            | Bytecode::DConst(_)
            | Bytecode::Ldc(_)
            | Bytecode::Load(..)
            | Bytecode::Store(..)
            | Bytecode::If(..)
            | Bytecode::IfICmp(..)
            | Bytecode::Goto(_) => 1,
            Bytecode::Other(_) if name == "raw" => 1,
            _ => 0,
        };
        expected_operands(operands)?;
        Ok(op)
    }
}

impl TryFrom<String> for Bytecode {
    type Error = MethodParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Bytecode> for String {
    fn from(value: Bytecode) -> Self {
        value.to_string()
    }
}

impl Serialize for Bytecode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Bytecode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A resolved constant-pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Constant {
    Int(i32),
    Float(f32),
    Object(ObjectRef),
}

impl Constant {
    pub fn basic_type(&self) -> BasicType {
        match self {
            Constant::Int(_) => BasicType::Int,
            Constant::Float(_) => BasicType::Float,
            Constant::Object(_) => BasicType::Object,
        }
    }
}

/// A method as handed over by the interpreter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    pub max_locals: u16,
    pub max_stack: u16,
    /// Parameter types, in local-slot order (a `long` parameter takes two slots).
    #[serde(default)]
    pub params: Vec<BasicType>,
    pub code: Vec<Bytecode>,
    #[serde(default)]
    pub constants: Vec<Constant>,
}

impl Method {
    pub fn new(name: &str, max_locals: u16, max_stack: u16, params: &[BasicType]) -> Self {
        Self {
            name: name.to_string(),
            max_locals,
            max_stack,
            params: params.to_vec(),
            code: Vec::new(),
            constants: Vec::new(),
        }
    }

    /// Build a method from mnemonic lines.
    pub fn with_code(mut self, code: &[&str]) -> Result<Self, MethodParseError> {
        self.code = code.iter().map(|line| line.parse()).collect::<Result<_, _>>()?;
        Ok(self)
    }

    pub fn with_constants(mut self, constants: &[Constant]) -> Self {
        self.constants = constants.to_vec();
        self
    }

    /// Number of local slots the parameters occupy.
    pub fn parameter_slots(&self) -> usize {
        self.params.iter().map(|t| t.word_size()).sum()
    }

    /// Total number of frame locations (locals followed by the expression stack).
    pub fn location_count(&self) -> usize {
        self.max_locals as usize + self.max_stack as usize
    }

    /// Every bci that is the target of some branch, in ascending order.
    pub fn branch_targets(&self) -> Vec<usize> {
        let mut targets: Vec<usize> = self.code.iter().filter_map(|op| op.branch_target()).collect();
        targets.sort_unstable();
        targets.dedup();
        targets
    }

    /// Structural checks the interpreter's verifier would already guarantee.
    pub fn validate(&self) -> Result<(), MethodParseError> {
        if self.parameter_slots() > self.max_locals as usize {
            return Err(MethodParseError::Header(format!(
                "parameters need {} slots but max_locals is {}",
                self.parameter_slots(),
                self.max_locals
            )));
        }
        if self.params.contains(&BasicType::Void) {
            return Err(MethodParseError::Header("void parameter".to_string()));
        }
        for (bci, op) in self.code.iter().enumerate() {
            if let Some(target) = op.branch_target()
                && target >= self.code.len()
            {
                return Err(MethodParseError::Invalid {
                    bci,
                    reason: format!("branch target {} outside method", target),
                });
            }
            let local = match *op {
                Bytecode::Load(t, n) | Bytecode::Store(t, n) => Some(n as usize + t.word_size()),
                Bytecode::IInc(n, _) => Some(n as usize + 1),
                _ => None,
            };
            if let Some(end) = local
                && end > self.max_locals as usize
            {
                return Err(MethodParseError::Invalid {
                    bci,
                    reason: format!("local access past max_locals {}", self.max_locals),
                });
            }
            if let Bytecode::Ldc(n) = *op
                && n as usize >= self.constants.len()
            {
                return Err(MethodParseError::Invalid {
                    bci,
                    reason: format!("constant {} out of range", n),
                });
            }
        }
        Ok(())
    }

    /// Parse a method from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, MethodParseError> {
        let method: Method = toml::from_str(text)?;
        method.validate()?;
        Ok(method)
    }

    /// Load a method description from a TOML file.
    pub fn load(path: &Path) -> Result<Self, MethodParseError> {
        let text = fs::read_to_string(path).map_err(|source| MethodParseError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mnemonics() {
        assert_eq!("iload 0".parse::<Bytecode>().unwrap(), Bytecode::Load(BasicType::Int, 0));
        assert_eq!("dstore 2".parse::<Bytecode>().unwrap(), Bytecode::Store(BasicType::Double, 2));
        assert_eq!(
            "iadd".parse::<Bytecode>().unwrap(),
            Bytecode::Arith(BasicType::Int, ArithOp::Add)
        );
        assert_eq!(
            "if_icmplt 7".parse::<Bytecode>().unwrap(),
            Bytecode::IfICmp(BranchCond::Lt, 7)
        );
        assert_eq!("ifeq 3".parse::<Bytecode>().unwrap(), Bytecode::If(BranchCond::Eq, 3));
        assert_eq!("return".parse::<Bytecode>().unwrap(), Bytecode::Return(BasicType::Void));
        assert_eq!("freturn".parse::<Bytecode>().unwrap(), Bytecode::Return(BasicType::Float));
        assert_eq!("athrow".parse::<Bytecode>().unwrap(), Bytecode::Other(0xbf));
        assert_eq!("raw 0xca".parse::<Bytecode>().unwrap(), Bytecode::Other(0xca));
        assert_eq!(
            "invokestatic 3 2 int".parse::<Bytecode>().unwrap(),
            Bytecode::InvokeStatic {
                method: 3,
                parameter_slots: 2,
                returns: BasicType::Int
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "frobnicate".parse::<Bytecode>(),
            Err(MethodParseError::UnknownInstruction(_))
        ));
        assert!(matches!(
            "iload".parse::<Bytecode>(),
            Err(MethodParseError::BadOperand { .. })
        ));
        assert!(matches!(
            "iadd 1".parse::<Bytecode>(),
            Err(MethodParseError::BadOperand { .. })
        ));
        assert!("aadd".parse::<Bytecode>().is_err());
    }

    #[test]
    fn test_display_is_parseable() {
        for text in ["iload 3", "lconst 9", "if_icmpge 4", "goto 0", "dreturn", "idiv", "iinc 1 -2"] {
            let op: Bytecode = text.parse().unwrap();
            assert_eq!(op.to_string(), text);
        }
    }

    #[test]
    fn test_two_word_types() {
        assert!(BasicType::Long.is_two_word());
        assert!(BasicType::Double.is_two_word());
        assert!(!BasicType::Float.is_two_word());
        assert_eq!(BasicType::Void.word_size(), 0);
    }

    #[test]
    fn test_method_from_toml() {
        let method = Method::from_toml_str(
            r#"
            name = "add"
            max_locals = 2
            max_stack = 2
            params = ["int", "int"]
            code = ["iload 0", "iload 1", "iadd", "ireturn"]
            "#,
        )
        .unwrap();
        assert_eq!(method.name, "add");
        assert_eq!(method.parameter_slots(), 2);
        assert_eq!(method.code.len(), 4);
        assert_eq!(method.location_count(), 4);
    }

    #[test]
    fn test_method_constants_from_toml() {
        let method = Method::from_toml_str(
            r#"
            name = "k"
            max_locals = 0
            max_stack = 1
            code = ["ldc 0", "areturn"]
            constants = [{ object = 64 }]
            "#,
        )
        .unwrap();
        assert_eq!(method.constants, vec![Constant::Object(ObjectRef(64))]);
    }

    #[test]
    fn test_validate_rejects_bad_target() {
        let method = Method::new("m", 0, 1, &[]).with_code(&["goto 5", "return"]).unwrap();
        assert!(matches!(method.validate(), Err(MethodParseError::Invalid { bci: 0, .. })));
    }

    #[test]
    fn test_validate_rejects_wide_local_overflow() {
        let method = Method::new("m", 1, 2, &[]).with_code(&["lload 0", "pop2", "return"]).unwrap();
        assert!(method.validate().is_err());
    }

    #[test]
    fn test_branch_targets() {
        let method = Method::new("m", 1, 1, &[BasicType::Int])
            .with_code(&["iload 0", "ifeq 4", "iconst 1", "ireturn", "goto 4"])
            .unwrap();
        assert_eq!(method.branch_targets(), vec![4]);
    }
}
