use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::parser::{quote_token, tokenize};
use super::{CompileError, Result};

/// Binary arithmetic operations available to `op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Integer division (floor).
    IDiv,
    /// Remainder.
    Mod,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
}

impl BinaryOp {
    fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "add" => BinaryOp::Add,
            "sub" => BinaryOp::Sub,
            "mul" => BinaryOp::Mul,
            "div" => BinaryOp::Div,
            "idiv" => BinaryOp::IDiv,
            "mod" => BinaryOp::Mod,
            "min" => BinaryOp::Min,
            "max" => BinaryOp::Max,
            _ => return None,
        })
    }

    fn name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::IDiv => "idiv",
            BinaryOp::Mod => "mod",
            BinaryOp::Min => "min",
            BinaryOp::Max => "max",
        }
    }

    /// Apply the operation to two numeric operands.
    pub fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::IDiv => (a / b).floor(),
            BinaryOp::Mod => a % b,
            BinaryOp::Min => a.min(b),
            BinaryOp::Max => a.max(b),
        }
    }
}

/// Conditions available to `jump`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JumpCond {
    /// Unconditional.
    Always,
    /// Operands compare equal.
    Eq,
    /// Operands compare unequal.
    NotEq,
    /// First operand is numerically smaller.
    LessThan,
    /// First operand is numerically larger.
    GreaterThan,
}

impl JumpCond {
    fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "always" => JumpCond::Always,
            "equal" => JumpCond::Eq,
            "notEqual" => JumpCond::NotEq,
            "lessThan" => JumpCond::LessThan,
            "greaterThan" => JumpCond::GreaterThan,
            _ => return None,
        })
    }

    fn name(&self) -> &'static str {
        match self {
            JumpCond::Always => "always",
            JumpCond::Eq => "equal",
            JumpCond::NotEq => "notEqual",
            JumpCond::LessThan => "lessThan",
            JumpCond::GreaterThan => "greaterThan",
        }
    }
}

/// One compiled instruction.
///
/// Operand fields hold raw tokens; variable names resolve against the
/// executing processor at run time, anything else coerces as a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    /// Store a value into a variable.
    Set {
        /// Destination variable name.
        dest: String,
        /// Value operand token.
        value: String,
    },
    /// Binary arithmetic into a variable.
    Op {
        /// Operation kind.
        op: BinaryOp,
        /// Destination variable name.
        dest: String,
        /// Left operand token.
        a: String,
        /// Right operand token.
        b: String,
    },
    /// Conditional transfer of control to an absolute instruction index.
    Jump {
        /// Destination instruction index.
        target: usize,
        /// Branch condition.
        cond: JumpCond,
        /// Left operand token.
        a: String,
        /// Right operand token.
        b: String,
    },
    /// Finish this tick's slice and restart from the top next tick.
    End,
    /// Write a value into a shared stack slot.
    Push {
        /// Value operand token.
        value: String,
        /// Slot index operand token.
        index: String,
        /// Stack name operand token.
        stack: String,
    },
    /// Read a shared stack slot into a variable.
    Pop {
        /// Destination variable name.
        dest: String,
        /// Slot index operand token.
        index: String,
        /// Stack name operand token.
        stack: String,
    },
    /// Invoke a nested program compiled from embedded source.
    Call {
        /// Decoded nested program source.
        source: String,
        /// Logical name of the call site.
        name: String,
    },
    /// Bind to a unit from a group pool.
    Bind {
        /// Mode token (`claim` or `access`).
        mode: String,
        /// Unit kind selector token, `_` for none.
        kind: String,
        /// Requested count operand token.
        count: String,
        /// Scope name token, `_` for the private per-owner pool.
        scope: String,
        /// Variable receiving the bound unit or null.
        unit_dest: String,
        /// Variable receiving the member index or a negative error code.
        index_dest: String,
    },
}

/// Placeholder token for an absent kind or scope parameter.
pub const NONE_TOKEN: &str = "_";

impl Instr {
    /// Parse one tokenized line into an instruction.
    fn parse(tokens: &[String]) -> Result<Instr> {
        let opcode = tokens[0].as_str();
        let arg = |pos: usize| -> Result<String> {
            tokens
                .get(pos)
                .cloned()
                .ok_or_else(|| CompileError::Parameters(format!("{opcode} missing operand {pos}")))
        };
        let arg_or = |pos: usize, default: &str| -> String {
            tokens
                .get(pos)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        match opcode {
            "set" => Ok(Instr::Set {
                dest: arg(1)?,
                value: arg(2)?,
            }),
            "op" => {
                let kind = arg(1)?;
                let op = BinaryOp::parse(&kind)
                    .ok_or_else(|| CompileError::Parameters(format!("unknown op kind: {kind}")))?;
                Ok(Instr::Op {
                    op,
                    dest: arg(2)?,
                    a: arg(3)?,
                    b: arg(4)?,
                })
            }
            "jump" => {
                let target = arg(1)?.parse::<usize>().map_err(|_| {
                    CompileError::Parameters("jump target must be an instruction index".into())
                })?;
                let cond_token = arg(2)?;
                let cond = JumpCond::parse(&cond_token).ok_or_else(|| {
                    CompileError::Parameters(format!("unknown jump condition: {cond_token}"))
                })?;
                Ok(Instr::Jump {
                    target,
                    cond,
                    a: arg_or(3, "0"),
                    b: arg_or(4, "0"),
                })
            }
            "end" => Ok(Instr::End),
            "push" => Ok(Instr::Push {
                value: arg(1)?,
                index: arg_or(2, "0"),
                stack: arg_or(3, crate::runtime::stacks::DEFAULT_STACK),
            }),
            "pop" => Ok(Instr::Pop {
                dest: arg(1)?,
                index: arg_or(2, "0"),
                stack: arg_or(3, crate::runtime::stacks::DEFAULT_STACK),
            }),
            "call" => {
                let encoded = arg(1)?;
                let source = decode_nested_source(&encoded);
                Ok(Instr::Call {
                    source,
                    name: arg_or(2, "nested"),
                })
            }
            "bind" => Ok(Instr::Bind {
                mode: arg(1)?,
                kind: arg(2)?,
                count: arg(3)?,
                scope: arg(4)?,
                unit_dest: arg(5)?,
                index_dest: arg(6)?,
            }),
            other => Err(CompileError::UnknownInstruction(other.to_string())),
        }
    }

    /// Serialize back to one wire line.
    pub fn serialize(&self) -> String {
        match self {
            Instr::Set { dest, value } => format!("set {} {}", dest, emit(value)),
            Instr::Op { op, dest, a, b } => {
                format!("op {} {} {} {}", op.name(), dest, emit(a), emit(b))
            }
            Instr::Jump { target, cond, a, b } => {
                format!("jump {} {} {} {}", target, cond.name(), emit(a), emit(b))
            }
            Instr::End => "end".to_string(),
            Instr::Push {
                value,
                index,
                stack,
            } => format!("push {} {} {}", emit(value), emit(index), emit(stack)),
            Instr::Pop { dest, index, stack } => {
                format!("pop {} {} {}", dest, emit(index), emit(stack))
            }
            Instr::Call { source, name } => {
                format!("call \"{}\" {}", BASE64.encode(source.as_bytes()), name)
            }
            Instr::Bind {
                mode,
                kind,
                count,
                scope,
                unit_dest,
                index_dest,
            } => format!(
                "bind {} {} {} {} {} {}",
                mode,
                kind,
                emit(count),
                scope,
                unit_dest,
                index_dest
            ),
        }
    }
}

/// Decode the base64 nested-source token, falling back to an empty program
/// when the blob does not decode byte-for-byte.
fn decode_nested_source(token: &str) -> String {
    let trimmed = token
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(token);
    match BASE64.decode(trimmed.as_bytes()) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(source) => source,
            Err(_) => {
                debug!("nested source is not valid UTF-8, loading empty program");
                String::new()
            }
        },
        Err(_) => {
            debug!("nested source token is not valid base64, loading empty program");
            String::new()
        }
    }
}

/// Re-emit a stored operand token, re-escaping quoted tokens.
fn emit(token: &str) -> String {
    if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
        quote_token(&token[1..token.len() - 1])
    } else {
        token.to_string()
    }
}

/// A compiled logic program: a flat, immutable instruction list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    instrs: Vec<Instr>,
}

impl Program {
    /// The empty program; executing it is a no-op.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile source text, one instruction per line.
    ///
    /// Blank lines and `#` comment lines are skipped.
    pub fn compile(source: &str) -> Result<Program> {
        let mut instrs = Vec::new();
        for line in source.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let tokens = tokenize(trimmed)?;
            if tokens.is_empty() {
                continue;
            }
            instrs.push(Instr::parse(&tokens)?);
        }
        Ok(Program { instrs })
    }

    /// Serialize every instruction back to wire lines.
    pub fn serialize(&self) -> String {
        self.instrs
            .iter()
            .map(Instr::serialize)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    /// Whether the program has no instructions.
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Instruction at `index`, if in range.
    pub fn get(&self, index: usize) -> Option<&Instr> {
        self.instrs.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_core_instructions() {
        let source = "set x 5\nop add y x 1\njump 0 lessThan y 10\nend";
        let program = Program::compile(source).expect("compile");
        assert_eq!(program.len(), 4);
        assert_eq!(
            program.get(0),
            Some(&Instr::Set {
                dest: "x".into(),
                value: "5".into()
            })
        );
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        let program = Program::compile("# header\n\nset x 1\n").expect("compile");
        assert_eq!(program.len(), 1);
    }

    #[test]
    fn push_and_pop_fill_defaults() {
        let program = Program::compile("push 5\npop result").expect("compile");
        assert_eq!(
            program.get(0),
            Some(&Instr::Push {
                value: "5".into(),
                index: "0".into(),
                stack: "default".into()
            })
        );
        assert_eq!(
            program.get(1),
            Some(&Instr::Pop {
                dest: "result".into(),
                index: "0".into(),
                stack: "default".into()
            })
        );
    }

    #[test]
    fn call_round_trips_source_byte_for_byte() {
        let nested = "set inner 1\npush inner 0 mailbox";
        let line = Instr::Call {
            source: nested.to_string(),
            name: "worker".to_string(),
        }
        .serialize();
        let program = Program::compile(&line).expect("compile");
        match program.get(0) {
            Some(Instr::Call { source, name }) => {
                assert_eq!(source, nested);
                assert_eq!(name, "worker");
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn malformed_base64_loads_empty_source() {
        let program = Program::compile("call \"!!notbase64!!\" worker").expect("compile");
        match program.get(0) {
            Some(Instr::Call { source, .. }) => assert!(source.is_empty()),
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn bind_requires_all_parameters() {
        let program = Program::compile("bind claim _ 3 alpha unit idx").expect("compile");
        assert_eq!(
            program.get(0),
            Some(&Instr::Bind {
                mode: "claim".into(),
                kind: "_".into(),
                count: "3".into(),
                scope: "alpha".into(),
                unit_dest: "unit".into(),
                index_dest: "idx".into()
            })
        );
        assert!(Program::compile("bind claim _ 3 alpha unit").is_err());
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert!(matches!(
            Program::compile("frobnicate 1"),
            Err(CompileError::UnknownInstruction(_))
        ));
    }

    #[test]
    fn serialization_round_trips_whole_programs() {
        let source = concat!(
            "set x 5\n",
            "op add y x 1\n",
            "push \"hello world\" 0 mailbox\n",
            "pop result 0 mailbox\n",
            "bind claim _ 2 alpha unit idx\n",
            "jump 0 always 0 0\n",
            "end"
        );
        let program = Program::compile(source).expect("compile");
        let reparsed = Program::compile(&program.serialize()).expect("reparse");
        assert_eq!(program, reparsed);
    }
}
