//! Turns a meta expression into a [`MetaField`] and its [`MetaTarget`].

use probe_common::{
    btf::{Btf, Type, TypeId},
    schema::{META_SET_MAX, META_TARGET_MAX},
};

use super::{
    MetaError,
    filter::{MetaCmp, MetaField, MetaLoad, MetaTarget, MetaType},
};

const POINTER_SIZE: u32 = 8;

#[derive(Debug, Default)]
struct LhsNode<'a> {
    member: &'a str,
    mask: u64,
    tgt_type: Option<&'a str>,
}

#[derive(Debug, PartialEq, Eq)]
enum Rval {
    Dec(String),
    Hex(String),
    Str(String),
    Set(Vec<Rval>),
}

impl Rval {
    fn parse(rval: &str) -> Result<Rval, MetaError> {
        let quoted = |q: char| rval.len() >= 2 && rval.starts_with(q) && rval.ends_with(q);
        if quoted('"') || quoted('\'') {
            return Ok(Rval::Str(rval[1..rval.len() - 1].to_string()));
        }
        if let Some(set) = rval.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            let values = set
                .split(',')
                .map(str::trim)
                .map(|value| match Rval::parse(value)? {
                    Rval::Dec(v) => Ok(Rval::Dec(v)),
                    Rval::Hex(v) => Ok(Rval::Hex(v)),
                    _ => Err(MetaError::InvalidValue(value.to_string())),
                })
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Rval::Set(values));
        }
        Ok(match rval.strip_prefix("0x") {
            Some(hex) => Rval::Hex(hex.to_string()),
            None => Rval::Dec(rval.to_string()),
        })
    }

    fn number(&self, signed: bool) -> Result<u64, MetaError> {
        let invalid = |value: &str| MetaError::InvalidValue(value.to_string());
        match self {
            Rval::Dec(value) if value.starts_with('-') => {
                if !signed {
                    return Err(MetaError::InvalidValue(format!(
                        "{value} is signed while type is unsigned"
                    )));
                }
                value.parse::<i64>().map(|v| v as u64).map_err(|_| invalid(value))
            }
            Rval::Dec(value) => value.parse::<u64>().map_err(|_| invalid(value)),
            Rval::Hex(value) => u64::from_str_radix(value, 16).map_err(|_| invalid(value)),
            Rval::Str(value) => Err(invalid(value)),
            Rval::Set(_) => Err(MetaError::SetOperator),
        }
    }
}

fn parse_mask(el: &str) -> Result<u64, MetaError> {
    let (el, not) = match el.strip_prefix('~') {
        Some(num) => (num, true),
        None => (el, false),
    };

    let (base, mask_str) = if let Some(hex) = el.strip_prefix("0x") {
        (16, hex)
    } else if let Some(bin) = el.strip_prefix("0b") {
        (2, bin)
    } else {
        (10, el)
    };

    let mask = u64::from_str_radix(mask_str, base)
        .map_err(|_| MetaError::InvalidMask(el.to_string()))?;
    let mask = if not { !mask } else { mask };
    if mask == 0 {
        return Err(MetaError::ZeroMask);
    }

    Ok(mask)
}

/// Split the expression into the member chain, the operator and the
/// right-hand side. Elements are separated by single spaces.
fn parse_filter(filter: &str) -> Result<(Vec<LhsNode<'_>>, MetaCmp, &str), MetaError> {
    let expr = filter.split(' ').collect::<Vec<_>>();

    let (lhs, op, rhs) = match expr[..] {
        [lhs, op, rhs] => (lhs, op, rhs),
        [lhs] => (lhs, "!=", "0"),
        _ => return Err(MetaError::InvalidExpression(filter.to_string())),
    };

    let lhs = lhs
        .split('.')
        .enumerate()
        .map(|(pos, node)| {
            let first = pos == 0;
            let mut elem = node.split(':');
            // member is mandatory.
            let member = elem.next().unwrap_or_default();
            if first && member != "sk_buff" {
                return Err(MetaError::NotSkBuff);
            }
            let mask = match elem.next() {
                Some(_) if first => return Err(MetaError::InitialMask),
                Some(mask) => parse_mask(mask)?,
                None => 0,
            };
            let tgt_type = elem.next();
            if elem.next().is_some() || member.is_empty() {
                return Err(MetaError::FieldSyntax(node.to_string()));
            }

            Ok(LhsNode {
                member,
                mask,
                tgt_type,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if lhs.len() <= 1 {
        return Err(MetaError::NoMember);
    }

    let op = op
        .parse()
        .map_err(|_| MetaError::UnknownOperator(op.to_string()))?;
    Ok((lhs, op, rhs))
}

/// Count the pointer indirections of a type and find the struct or union
/// they lead to. When `casted` is set, a pointer-sized integer counts as a
/// pointer and ends the walk.
fn next_walkable(btf: &Btf, id: TypeId, casted: bool) -> Result<(u8, TypeId), MetaError> {
    let mut ind = 0;
    for (pos, (id, ty)) in btf.type_chain(id)?.into_iter().enumerate() {
        match ty {
            Type::Int(int) if int.size == POINTER_SIZE && casted => ind += 1,
            Type::Ptr(_) => ind += 1,
            Type::Struct(_) | Type::Union(_) => return Ok((ind, id)),
            ty if ty.is_modifier() => (),
            ty => return Err(MetaError::NotWalkable(ty.name().to_string())),
        }
        if pos == 0 && casted {
            return Ok((ind, id));
        }
    }
    Err(MetaError::NotWalkable(btf.get(id)?.name().to_string()))
}

fn emit_load_ptr(offt: u32, mask: u64) -> Result<MetaLoad, MetaError> {
    let offt = u16::try_from(offt / 8).map_err(|_| MetaError::OffsetOutOfRange(offt))?;
    Ok(MetaLoad::pointer(offt, mask))
}

fn emit_load(
    btf: &Btf,
    id: TypeId,
    offt: u32,
    bfs: u32,
    mask: u64,
) -> Result<MetaLoad, MetaError> {
    let mut load = MetaLoad::default();
    let unsupported = |what: &str, name: &str| MetaError::Unsupported(format!("{what} {name}"));

    for (_, ty) in btf.type_chain(id)? {
        match ty {
            Type::Ptr(_) => {
                if load.ptr {
                    return Err(MetaError::PointerToPointer);
                }
                load.ptr = true;
            }
            Type::Array { len, .. } => {
                if load.ptr {
                    return Err(unsupported("pointers to", "array"));
                }
                load.nmemb = u8::try_from(*len).map_err(|_| unsupported("large", "array"))?;
            }
            Type::Enum { name, size, signed } => {
                if load.ptr {
                    return Err(unsupported("pointers to", name));
                }
                load.ty = Some(if *size == 8 {
                    MetaType::Long
                } else {
                    MetaType::Int
                });
                load.signed = *signed;
            }
            Type::Int(int) => {
                load.signed = int.signed;
                load.ty = Some(
                    MetaType::from_size(int.size)
                        .ok_or_else(|| unsupported("integers of type", &int.name))?,
                );
                // Arrays and pointers are only supported for chars.
                if !load.is_byte() {
                    if load.is_arr() {
                        return Err(unsupported("array of", &int.name));
                    }
                    if load.ptr {
                        return Err(unsupported("pointers to", &int.name));
                    }
                }
            }
            ty if ty.is_modifier() => (),
            ty => return Err(unsupported("members of type", ty.name())),
        }
    }

    if mask > 0 {
        if load.ptr || (load.is_num() && !load.signed) {
            load.mask = mask;
        } else {
            return Err(MetaError::MaskNotSupported);
        }
    }

    load.bf_size = u8::try_from(bfs).map_err(|_| MetaError::OffsetOutOfRange(bfs))?;
    let offt = if bfs == 0 { offt / 8 } else { offt };
    load.offt = u16::try_from(offt).map_err(|_| MetaError::OffsetOutOfRange(offt))?;

    Ok(load)
}

fn emit_target(
    field: usize,
    load: &MetaLoad,
    rval: Rval,
    cmp: MetaCmp,
) -> Result<MetaTarget, MetaError> {
    let mut target = MetaTarget {
        field,
        cmp,
        md: [0; META_TARGET_MAX],
        sz: 0,
        count: 1,
    };

    if load.is_string() {
        if cmp != MetaCmp::Eq && cmp != MetaCmp::Ne {
            return Err(MetaError::StringOperator);
        }
        let Rval::Str(value) = rval else {
            return Err(MetaError::InvalidValue(
                "only strings are supported for arrays and pointers".to_string(),
            ));
        };
        if value.len() >= META_TARGET_MAX {
            return Err(MetaError::ValueTooLong);
        }
        target.md[..value.len()].copy_from_slice(value.as_bytes());
        target.sz = value.len() as u8;
        return Ok(target);
    }

    let Some(ty) = load.ty else {
        return Err(MetaError::InvalidValue("unexpected numeric type".to_string()));
    };
    target.sz = ty.size() as u8;

    match (rval, cmp) {
        (Rval::Set(values), MetaCmp::In) => {
            if values.is_empty() || values.len() > META_SET_MAX {
                return Err(MetaError::SetTooLarge);
            }
            for (i, value) in values.iter().enumerate() {
                let number = value.number(load.signed)?;
                target.md[i * 8..i * 8 + 8].copy_from_slice(&number.to_ne_bytes());
            }
            target.count = values.len() as u8;
        }
        (Rval::Set(_), _) | (_, MetaCmp::In) => return Err(MetaError::SetOperator),
        (rval, _) => {
            let number = rval.number(load.signed)?;
            target.md[..8].copy_from_slice(&number.to_ne_bytes());
        }
    }

    Ok(target)
}

/// Compile `expression` into a field and a target comparing it, the target
/// referencing the field as `field`.
pub fn compile(
    btf: &Btf,
    expression: &str,
    field: usize,
) -> Result<(MetaField, MetaTarget), MetaError> {
    let (mut nodes, op, rval) = parse_filter(expression)?;
    let mut loads = Vec::new();
    let mut offt: u32 = 0;
    let mut stored_offset: u32 = 0;
    let mut stored_bf_size: u32 = 0;
    let mut mask = 0;

    // At least two elements are present.
    let init = nodes.remove(0).member;
    let mut ty = btf.resolve_struct(init)?;
    let mut leaf = ty;

    let last = nodes.len() - 1;
    for (pos, node) in nodes.iter().enumerate() {
        let member = btf
            .find_member(ty, node.member)?
            .ok_or_else(|| MetaError::MemberNotFound {
                member: node.member.to_string(),
                ty: btf.get(ty).map(|t| t.name().to_string()).unwrap_or_default(),
            })?;
        let offset = offt + member.bit_offset;

        if pos < last {
            // Pointers need an indirect load and reset the offset. Named
            // structs and unions are part of the parent, so the offset is
            // preserved.
            let (ind, next) = next_walkable(btf, member.ty, node.tgt_type.is_some())?;
            match ind {
                0 => {
                    if node.mask != 0 {
                        return Err(MetaError::IntermediateMask);
                    }
                    offt = offset;
                }
                1 => {
                    offt = 0;
                    loads.push(emit_load_ptr(offset, node.mask)?);
                }
                _ => return Err(MetaError::PointerToPointer),
            }

            ty = match node.tgt_type {
                Some(tgt) => {
                    let cast = btf
                        .resolve_types_by_name(tgt)
                        .into_iter()
                        .find(|(_, t)| {
                            matches!(t, Type::Struct(_) | Type::Union(_) | Type::Typedef { .. })
                        })
                        .map(|(id, _)| id)
                        .ok_or_else(|| MetaError::UnknownCast(tgt.to_string()))?;
                    let (ind, walkable) = next_walkable(btf, cast, false)?;
                    if ind > 0 {
                        return Err(MetaError::CastToPointer(tgt.to_string()));
                    }
                    walkable
                }
                None => next,
            };
        } else {
            if let Some(tgt) = node.tgt_type {
                return Err(MetaError::LeafCast(tgt.to_string()));
            }
            leaf = member.ty;
            mask = node.mask;
        }

        stored_offset = offset;
        stored_bf_size = member.bitfield_size.unwrap_or(0);
    }

    let load = emit_load(btf, leaf, stored_offset, stored_bf_size, mask)?;
    loads.push(load);

    let target = emit_target(field, &load, Rval::parse(rval)?, op)?;
    Ok((MetaField::new(loads)?, target))
}
