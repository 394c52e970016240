use netrace_core::filter::{Filter, FilterResult};
use probe_common::{
    ProbeContext,
    kernel::{KernelMemory, MemoryError},
    schema::{META_FILTER_TAG, META_OPS_MAX, META_SET_MAX, META_TARGET_MAX},
};
use strum::{Display, EnumString};

use super::MetaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[repr(u8)]
pub enum MetaCmp {
    #[strum(serialize = "==")]
    Eq = 0,
    #[strum(serialize = ">")]
    Gt = 1,
    #[strum(serialize = "<")]
    Lt = 2,
    #[strum(serialize = ">=")]
    Ge = 3,
    #[strum(serialize = "<=")]
    Le = 4,
    #[strum(serialize = "!=")]
    Ne = 5,
    #[strum(serialize = "in")]
    In = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetaType {
    Char = 1,
    Short = 2,
    Int = 3,
    Long = 4,
}

impl MetaType {
    pub fn from_size(size: u32) -> Option<Self> {
        match size {
            1 => Some(MetaType::Char),
            2 => Some(MetaType::Short),
            4 => Some(MetaType::Int),
            8 => Some(MetaType::Long),
            _ => None,
        }
    }

    pub fn size(self) -> usize {
        match self {
            MetaType::Char => 1,
            MetaType::Short => 2,
            MetaType::Int => 4,
            MetaType::Long => 8,
        }
    }
}

/// One memory load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaLoad {
    /// Type of the loaded data, `None` for plain pointers.
    pub ty: Option<MetaType>,
    pub ptr: bool,
    pub signed: bool,
    /// Number of elements for arrays, only valid for chars.
    pub nmemb: u8,
    /// Byte offset if `bf_size` is zero. Bit offset otherwise.
    pub offt: u16,
    /// Zero for no bitfield.
    pub bf_size: u8,
    /// Mask to apply, zero for none.
    pub mask: u64,
}

impl MetaLoad {
    /// Load of a pointer member at byte offset `offt`.
    pub fn pointer(offt: u16, mask: u64) -> Self {
        Self {
            ptr: true,
            offt,
            mask,
            ..Default::default()
        }
    }

    pub fn is_num(&self) -> bool {
        self.ty.is_some()
    }

    pub fn is_byte(&self) -> bool {
        self.ty == Some(MetaType::Char)
    }

    pub fn is_arr(&self) -> bool {
        self.nmemb > 0
    }

    /// Loads a string, either from a char array or through a char pointer.
    pub fn is_string(&self) -> bool {
        self.ptr || self.is_arr()
    }

    /// Type byte: bits 0-4 type, bit 6 pointer, bit 7 sign.
    pub fn type_bits(&self) -> u8 {
        let mut bits = self.ty.map(|ty| ty as u8).unwrap_or(0);
        if self.ptr {
            bits |= 1 << 6;
        }
        if self.signed {
            bits |= 1 << 7;
        }
        bits
    }

    /// Read the pointer this load describes, relative to `base`.
    fn read_ptr(&self, memory: &dyn KernelMemory, base: u64) -> Result<u64, MemoryError> {
        let mut ptr = memory.read_u64(base.wrapping_add(self.offt as u64))?;
        if self.mask != 0 {
            ptr &= self.mask;
        }
        match ptr {
            0 => Err(MemoryError::NullPointer),
            ptr => Ok(ptr),
        }
    }

    fn read_string(
        &self,
        memory: &dyn KernelMemory,
        base: u64,
    ) -> Result<FieldValue, MemoryError> {
        let mut bytes = [0; META_TARGET_MAX];
        let (addr, max) = if self.ptr {
            (self.read_ptr(memory, base)?, META_TARGET_MAX)
        } else {
            (
                base.wrapping_add(self.offt as u64),
                (self.nmemb as usize).min(META_TARGET_MAX),
            )
        };

        let mut len = 0;
        while len < max {
            let byte = memory.read_u8(addr.wrapping_add(len as u64))?;
            if byte == 0 {
                break;
            }
            bytes[len] = byte;
            len += 1;
        }
        Ok(FieldValue::Str { bytes, len })
    }

    fn read_num(
        &self,
        memory: &dyn KernelMemory,
        base: u64,
        ty: MetaType,
    ) -> Result<FieldValue, MemoryError> {
        let (raw, bits) = if self.bf_size > 0 {
            // Bitfields are laid out starting from the least significant bit.
            let offt = self.offt as u64;
            let shift = (offt % 8) as u32;
            let bits = (self.bf_size as u32).min(64);
            let len = (shift + bits).div_ceil(8) as usize;
            let mut buf = [0; 16];
            memory.read(base.wrapping_add(offt / 8), &mut buf[..len])?;
            let raw = (u128::from_le_bytes(buf) >> shift) as u64;
            (raw & low_bits(bits), bits)
        } else {
            let addr = base.wrapping_add(self.offt as u64);
            let raw = match ty {
                MetaType::Char => memory.read_u8(addr)? as u64,
                MetaType::Short => memory.read_u16(addr)? as u64,
                MetaType::Int => memory.read_u32(addr)? as u64,
                MetaType::Long => memory.read_u64(addr)?,
            };
            (raw, ty.size() as u32 * 8)
        };

        if self.signed {
            let shift = 64 - bits;
            Ok(FieldValue::Signed(((raw << shift) as i64) >> shift))
        } else if self.mask != 0 {
            Ok(FieldValue::Unsigned(raw & self.mask))
        } else {
            Ok(FieldValue::Unsigned(raw))
        }
    }
}

fn low_bits(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1 << bits) - 1 }
}

/// Value read from a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Unsigned(u64),
    Signed(i64),
    Str {
        bytes: [u8; META_TARGET_MAX],
        len: usize,
    },
}

/// A chain of loads starting at the `struct sk_buff`: pointer loads followed
/// by a final load of the compared value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaField {
    loads: Vec<MetaLoad>,
}

impl MetaField {
    pub fn new(loads: Vec<MetaLoad>) -> Result<Self, MetaError> {
        if loads.is_empty() {
            return Err(MetaError::NoMember);
        }
        if loads.len() > META_OPS_MAX - 1 {
            return Err(MetaError::TooManyLoads);
        }
        Ok(Self { loads })
    }

    pub fn loads(&self) -> &[MetaLoad] {
        &self.loads
    }

    /// The final load.
    pub fn leaf(&self) -> &MetaLoad {
        &self.loads[self.loads.len() - 1]
    }

    /// Read the field starting from the skb at `skb`.
    pub fn read(&self, memory: &dyn KernelMemory, skb: u64) -> Result<FieldValue, MemoryError> {
        let (leaf, path) = self
            .loads
            .split_last()
            .ok_or(MemoryError::NullPointer)?;

        let mut base = skb;
        for load in path {
            base = load.read_ptr(memory, base)?;
        }

        match leaf.ty {
            Some(ty) if !leaf.is_string() => leaf.read_num(memory, base, ty),
            _ => leaf.read_string(memory, base),
        }
    }
}

/// Value a field is compared to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaTarget {
    /// Index of the field in the filter.
    pub field: usize,
    pub cmp: MetaCmp,
    /// Target value: a string or up to [`META_SET_MAX`] native endian 64-bit
    /// numbers.
    pub md: [u8; META_TARGET_MAX],
    /// Size of the string, or of the compared number.
    pub sz: u8,
    /// Number of values in `md`.
    pub count: u8,
}

impl MetaTarget {
    fn number(&self, i: usize) -> u64 {
        let mut value = [0; 8];
        value.copy_from_slice(&self.md[i * 8..i * 8 + 8]);
        u64::from_ne_bytes(value)
    }

    /// Check the target can be compared to values read by `leaf`.
    fn check(&self, leaf: &MetaLoad) -> Result<(), MetaError> {
        if leaf.is_string() {
            if !matches!(self.cmp, MetaCmp::Eq | MetaCmp::Ne) {
                return Err(MetaError::StringOperator);
            }
            if self.sz as usize >= META_TARGET_MAX {
                return Err(MetaError::ValueTooLong);
            }
        } else if self.cmp == MetaCmp::In
            && (self.count == 0 || self.count as usize > META_SET_MAX)
        {
            return Err(MetaError::SetTooLarge);
        }
        Ok(())
    }

    pub fn numbers(&self) -> impl Iterator<Item = u64> + '_ {
        (0..(self.count as usize).min(META_SET_MAX)).map(|i| self.number(i))
    }

    /// Check `value` against the target.
    pub fn holds(&self, value: &FieldValue) -> bool {
        match value {
            FieldValue::Str { bytes, len } => {
                let equal = self
                    .md
                    .get(..self.sz as usize)
                    .is_some_and(|md| bytes[..*len] == *md);
                match self.cmp {
                    MetaCmp::Eq => equal,
                    MetaCmp::Ne => !equal,
                    _ => false,
                }
            }
            FieldValue::Unsigned(value) => self.compare(*value, |v| v, Ord::cmp),
            FieldValue::Signed(value) => self.compare(*value, |v| v as i64, Ord::cmp),
        }
    }

    fn compare<T: Copy + Eq>(
        &self,
        value: T,
        convert: impl Fn(u64) -> T,
        cmp: impl Fn(&T, &T) -> std::cmp::Ordering,
    ) -> bool {
        use std::cmp::Ordering::*;

        if self.cmp == MetaCmp::In {
            return self.numbers().any(|target| convert(target) == value);
        }
        let order = cmp(&value, &convert(self.number(0)));
        match self.cmp {
            MetaCmp::Eq => order == Equal,
            MetaCmp::Ne => order != Equal,
            MetaCmp::Gt => order == Greater,
            MetaCmp::Ge => order != Less,
            MetaCmp::Lt => order == Less,
            MetaCmp::Le => order != Greater,
            MetaCmp::In => false,
        }
    }
}

/// Filter on skb metadata. Matches if every target holds.
#[derive(Debug, Clone)]
pub struct MetaFilter {
    fields: Vec<MetaField>,
    targets: Vec<MetaTarget>,
}

impl MetaFilter {
    pub fn new(fields: Vec<MetaField>, targets: Vec<MetaTarget>) -> Result<Self, MetaError> {
        if fields.len() > META_TARGET_MAX {
            return Err(MetaError::TooManyFields);
        }
        for target in &targets {
            let field = fields
                .get(target.field)
                .ok_or(MetaError::UnknownField(target.field))?;
            target.check(field.leaf())?;
        }
        Ok(Self { fields, targets })
    }

    pub fn fields(&self) -> &[MetaField] {
        &self.fields
    }

    pub fn targets(&self) -> &[MetaTarget] {
        &self.targets
    }
}

impl Filter for MetaFilter {
    fn tag(&self) -> u32 {
        META_FILTER_TAG
    }

    fn evaluate_one(&self, ctx: &ProbeContext) -> FilterResult {
        let Some(skb) = ctx.skb() else {
            return FilterResult::Inconclusive;
        };

        let mut result = FilterResult::Match;
        for target in &self.targets {
            let Some(field) = self.fields.get(target.field) else {
                return FilterResult::Inconclusive;
            };
            match field.read(ctx.memory, skb) {
                Ok(value) if target.holds(&value) => (),
                Ok(_) => result = FilterResult::NoMatch,
                Err(err) => {
                    log::trace!("meta field {} unavailable: {err}", target.field);
                    return FilterResult::Inconclusive;
                }
            }
        }
        result
    }
}
