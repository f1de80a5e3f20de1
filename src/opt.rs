//! Constant folding over the postfix instruction stream.
//!
//! The pass walks the instructions once while mirroring their effect on a tracking stack.
//! Each entry remembers where its code starts and, if known at compile time, its value.
//! With that it can:
//!  - evaluate operators and built-ins whose operands are all constant,
//!  - drop neutral right operands (`x + 0`, `x - 0`, `x * 1`, `x / 1`, `x ^ 1`),
//!  - keep only the taken branch of a select with a constant condition.
//!
//! `random` and external calls are never folded.

use tracing::trace;

use crate::domain::NumericDomain;
use crate::errors::Result;
use crate::expr::BinaryOp;
use crate::functions::Builtin;
use crate::program::{Instr, Program};

struct Slot<V> {
    start: usize,
    value: Option<V>,
}

/// Folds every compile-time constant subexpression of `program`.
pub fn fold_constants<D: NumericDomain>(program: Program<D>) -> Result<Program<D>> {
    let (code, references, tolerance) = program.into_parts();
    let before = code.len();
    let mut out: Vec<Instr<D::Value>> = Vec::with_capacity(code.len());
    let mut slots: Vec<Slot<D::Value>> = Vec::with_capacity(8);

    let zero = D::from_real(0.0);
    let one = D::from_real(1.0);

    for instr in code {
        let arity = instr.arity();
        if slots.len() < arity {
            // Malformed streams are rejected by validation below.
            out.push(instr);
            slots.clear();
            continue;
        }
        let operands = slots.split_off(slots.len() - arity);
        let start = operands.first().map_or(out.len(), |slot| slot.start);
        let constants: Option<Vec<D::Value>> = operands.iter().map(|slot| slot.value).collect();

        let folded = match (&instr, &constants) {
            (Instr::Const(value), _) => Some(*value),
            (Instr::Load(_) | Instr::Call(..), _) => None,
            (Instr::Builtin(Builtin::Random, _), _) => None,
            (Instr::Neg, Some(args)) => Some(D::neg(args[0])),
            (Instr::Not, Some(args)) => Some(D::boolean(!D::truthy(args[0]))),
            (Instr::Binary(op), Some(args)) => Some(D::binary(*op, args[0], args[1], &tolerance)),
            (Instr::Select, Some(args)) => Some(if D::truthy(args[0]) { args[1] } else { args[2] }),
            (Instr::Builtin(builtin, _), Some(args)) => Some(D::apply(*builtin, args)),
            _ => None,
        };

        if let Some(value) = folded {
            out.truncate(start);
            out.push(Instr::Const(value));
            slots.push(Slot {
                start,
                value: Some(value),
            });
            continue;
        }

        match instr {
            Instr::Binary(op) if is_neutral(op, operands[1].value, zero, one) => {
                out.truncate(operands[1].start);
                slots.push(Slot { start, value: None });
            }
            Instr::Select if operands[0].value.is_some() => {
                let taken = operands[0].value.is_some_and(D::truthy);
                let (condition, if_true, if_false) =
                    (operands[0].start, operands[1].start, operands[2].start);
                if taken {
                    out.truncate(if_false);
                    out.drain(condition..if_true);
                } else {
                    out.drain(condition..if_false);
                }
                let value = if taken {
                    operands[1].value
                } else {
                    operands[2].value
                };
                slots.push(Slot { start, value });
            }
            instr => {
                out.push(instr);
                slots.push(Slot { start, value: None });
            }
        }
    }

    trace!(before, after = out.len(), "folded constants");
    Program::new(out, references, tolerance)
}

fn is_neutral<V: PartialEq>(op: BinaryOp, right: Option<V>, zero: V, one: V) -> bool {
    match (op, right) {
        (BinaryOp::Add | BinaryOp::Sub, Some(value)) => value == zero,
        (BinaryOp::Mul | BinaryOp::Div | BinaryOp::Pow, Some(value)) => value == one,
        _ => false,
    }
}
