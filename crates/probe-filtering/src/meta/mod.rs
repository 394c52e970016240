//! # Meta filter
//!
//! Filters packets on the content of the `struct sk_buff` and of the
//! structures reachable from it. A filter is built from expressions like
//! `sk_buff.dev.name == 'eth0'` or `sk_buff.mark:0xff == 0x1`:
//!
//! - the left-hand side walks members starting from `sk_buff`, following
//!   pointers. Each member can carry a mask and intermediate pointer-sized
//!   members can be cast to a struct (`sk_buff._nfct:~0x7:nf_conn.mark`);
//! - the operator is one of `== != < <= > >=`, or `in` followed by a set of
//!   up to 4 numbers (`{1,2,3}`);
//! - the right-hand side is a decimal or hex number or a quoted string.
//!
//! A bare left-hand side means `!= 0`.
//!
//! Each expression is compiled against the kernel type information into a
//! field (a chain of loads) and a target referencing the field by index.

mod compiler;
mod filter;

use probe_common::{btf::BtfError, schema::{META_OPS_MAX, META_SET_MAX, META_TARGET_MAX}};
use thiserror::Error;

pub use compiler::compile;
pub use filter::{FieldValue, MetaCmp, MetaField, MetaFilter, MetaLoad, MetaTarget, MetaType};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetaError {
    #[error("invalid filter ({0})")]
    InvalidExpression(String),
    #[error("starting struct isn't supported (not sk_buff)")]
    NotSkBuff,
    #[error("initial type must be a base type only")]
    InitialMask,
    #[error("expression does not point to a member")]
    NoMember,
    #[error("unexpected field expression {0} (must be under the form field[:mask[:type]])")]
    FieldSyntax(String),
    #[error("invalid mask {0}. Use an hex, binary or decimal mask (0x<hex>, 0b<bin>, <decimal>)")]
    InvalidMask(String),
    #[error("mask cannot be zero")]
    ZeroMask,
    #[error("unknown comparison operator ({0})")]
    UnknownOperator(String),
    #[error("field {member} not found in type {ty}")]
    MemberNotFound { member: String, ty: String },
    #[error("pointers of pointers are not supported")]
    PointerToPointer,
    #[error("intermediate members masking is only supported for pointers and unsigned numbers")]
    IntermediateMask,
    #[error("could not resolve {0} to a struct or typedef")]
    UnknownCast(String),
    #[error("cast type {0} cannot be an alias to a pointer")]
    CastToPointer(String),
    #[error("trying to cast a leaf member into {0}")]
    LeafCast(String),
    #[error("unexpected type ({0}) while walking struct members")]
    NotWalkable(String),
    #[error("{0} are not supported")]
    Unsupported(String),
    #[error("mask is only supported for pointers and unsigned numeric members")]
    MaskNotSupported,
    #[error("only '==' and '!=' are supported for strings")]
    StringOperator,
    #[error("'in' requires a set of numbers and sets require 'in'")]
    SetOperator,
    #[error("invalid target value ({0})")]
    InvalidValue(String),
    #[error("invalid target size (max {})", META_TARGET_MAX - 1)]
    ValueTooLong,
    #[error("too many values in set (max {META_SET_MAX})")]
    SetTooLarge,
    #[error("too many fields (max {META_TARGET_MAX})")]
    TooManyFields,
    #[error("too many loads (max {})", META_OPS_MAX - 1)]
    TooManyLoads,
    #[error("target references unknown field {0}")]
    UnknownField(usize),
    #[error("member offset {0} is out of range")]
    OffsetOutOfRange(u32),
    #[error(transparent)]
    Btf(#[from] BtfError),
}
