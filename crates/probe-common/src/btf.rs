//! Minimal in-memory model of the kernel BTF type information.
//!
//! Only what is needed to locate members inside kernel structures is kept:
//! integers, pointers, arrays, structs and unions with their member bit
//! offsets, enums and the type modifiers. Types are referenced by [`TypeId`],
//! id 0 being `void`.

use thiserror::Error;

pub type TypeId = u32;

/// Maximum number of typedef/modifier hops followed when resolving a type.
const MAX_RESOLVE_DEPTH: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BtfError {
    #[error("type id {0} not found")]
    UnknownId(TypeId),
    #[error("type {0} not found")]
    UnknownName(String),
    #[error("type chain starting at {0} is too deep")]
    TooDeep(TypeId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Int {
    pub name: String,
    /// Size in bytes.
    pub size: u32,
    pub signed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Empty for anonymous members.
    pub name: String,
    pub ty: TypeId,
    /// Offset from the start of the enclosing struct, in bits.
    pub bit_offset: u32,
    pub bitfield_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Struct {
    pub name: String,
    pub size: u32,
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Void,
    Int(Int),
    Ptr(TypeId),
    Array { elem: TypeId, len: u32 },
    Struct(Struct),
    Union(Struct),
    Enum { name: String, size: u32, signed: bool },
    Typedef { name: String, ty: TypeId },
    Const(TypeId),
    Volatile(TypeId),
}

impl Type {
    pub fn name(&self) -> &str {
        match self {
            Type::Void => "void",
            Type::Int(int) => &int.name,
            Type::Ptr(_) => "pointer",
            Type::Array { .. } => "array",
            Type::Struct(s) | Type::Union(s) => &s.name,
            Type::Enum { name, .. } | Type::Typedef { name, .. } => name,
            Type::Const(_) => "const",
            Type::Volatile(_) => "volatile",
        }
    }

    /// The type this one refers to, for types which are part of a chain.
    pub fn next(&self) -> Option<TypeId> {
        match self {
            Type::Ptr(ty) | Type::Const(ty) | Type::Volatile(ty) => Some(*ty),
            Type::Array { elem, .. } => Some(*elem),
            Type::Typedef { ty, .. } => Some(*ty),
            _ => None,
        }
    }

    pub fn is_modifier(&self) -> bool {
        matches!(
            self,
            Type::Typedef { .. } | Type::Const(_) | Type::Volatile(_)
        )
    }
}

/// A member found by [`Btf::find_member`], with its offset relative to the
/// outermost struct the lookup started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberInfo {
    pub bit_offset: u32,
    pub bitfield_size: Option<u32>,
    pub ty: TypeId,
}

#[derive(Debug, Clone)]
pub struct Btf {
    types: Vec<Type>,
}

impl Default for Btf {
    fn default() -> Self {
        Self::new()
    }
}

impl Btf {
    pub fn new() -> Self {
        Self {
            types: vec![Type::Void],
        }
    }

    /// Register a new type and return its id.
    pub fn add(&mut self, ty: Type) -> TypeId {
        self.types.push(ty);
        (self.types.len() - 1) as TypeId
    }

    pub fn add_int(&mut self, name: &str, size: u32, signed: bool) -> TypeId {
        self.add(Type::Int(Int {
            name: name.to_string(),
            size,
            signed,
        }))
    }

    pub fn add_ptr(&mut self, ty: TypeId) -> TypeId {
        self.add(Type::Ptr(ty))
    }

    pub fn add_array(&mut self, elem: TypeId, len: u32) -> TypeId {
        self.add(Type::Array { elem, len })
    }

    pub fn add_typedef(&mut self, name: &str, ty: TypeId) -> TypeId {
        self.add(Type::Typedef {
            name: name.to_string(),
            ty,
        })
    }

    pub fn add_struct(&mut self, name: &str, size: u32, members: Vec<Member>) -> TypeId {
        self.add(Type::Struct(Struct {
            name: name.to_string(),
            size,
            members,
        }))
    }

    pub fn add_union(&mut self, name: &str, size: u32, members: Vec<Member>) -> TypeId {
        self.add(Type::Union(Struct {
            name: name.to_string(),
            size,
            members,
        }))
    }

    /// Replace a previously registered type, used to build self-referencing
    /// structs.
    pub fn set(&mut self, id: TypeId, ty: Type) -> Result<(), BtfError> {
        let slot = self
            .types
            .get_mut(id as usize)
            .ok_or(BtfError::UnknownId(id))?;
        *slot = ty;
        Ok(())
    }

    pub fn get(&self, id: TypeId) -> Result<&Type, BtfError> {
        self.types.get(id as usize).ok_or(BtfError::UnknownId(id))
    }

    /// All the types called `name`.
    pub fn resolve_types_by_name(&self, name: &str) -> Vec<(TypeId, &Type)> {
        self.types
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, ty)| ty.name() == name)
            .map(|(id, ty)| (id as TypeId, ty))
            .collect()
    }

    /// The struct called `name`.
    pub fn resolve_struct(&self, name: &str) -> Result<TypeId, BtfError> {
        self.resolve_types_by_name(name)
            .into_iter()
            .find(|(_, ty)| matches!(ty, Type::Struct(_)))
            .map(|(id, _)| id)
            .ok_or_else(|| BtfError::UnknownName(name.to_string()))
    }

    /// Follow typedefs and modifiers starting at `id`.
    pub fn skip_modifiers(&self, mut id: TypeId) -> Result<TypeId, BtfError> {
        for _ in 0..MAX_RESOLVE_DEPTH {
            match self.get(id)? {
                ty if ty.is_modifier() => id = ty.next().ok_or(BtfError::UnknownId(id))?,
                _ => return Ok(id),
            }
        }
        Err(BtfError::TooDeep(id))
    }

    /// The chain of types starting at `id`, following pointers, arrays and
    /// modifiers, `id` included.
    pub fn type_chain(&self, id: TypeId) -> Result<Vec<(TypeId, &Type)>, BtfError> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(id) = current {
            if chain.len() == MAX_RESOLVE_DEPTH {
                return Err(BtfError::TooDeep(id));
            }
            let ty = self.get(id)?;
            chain.push((id, ty));
            current = ty.next();
        }
        Ok(chain)
    }

    /// Size in bytes of a type, pointers being 8 bytes.
    pub fn size_of(&self, id: TypeId) -> Result<u32, BtfError> {
        let id = self.skip_modifiers(id)?;
        Ok(match self.get(id)? {
            Type::Void => 0,
            Type::Int(int) => int.size,
            Type::Ptr(_) => 8,
            Type::Array { elem, len } => self.size_of(*elem)? * len,
            Type::Struct(s) | Type::Union(s) => s.size,
            Type::Enum { size, .. } => *size,
            Type::Typedef { .. } | Type::Const(_) | Type::Volatile(_) => 0,
        })
    }

    /// Look a member up by name in the struct or union `id`, descending into
    /// anonymous members. The returned offset is relative to `id`.
    pub fn find_member(&self, id: TypeId, name: &str) -> Result<Option<MemberInfo>, BtfError> {
        self.walk_member(id, name, 0, 0)
    }

    fn walk_member(
        &self,
        id: TypeId,
        name: &str,
        offset: u32,
        depth: usize,
    ) -> Result<Option<MemberInfo>, BtfError> {
        if depth == MAX_RESOLVE_DEPTH {
            return Err(BtfError::TooDeep(id));
        }
        let id = self.skip_modifiers(id)?;
        let members = match self.get(id)? {
            Type::Struct(s) | Type::Union(s) => &s.members,
            _ => return Ok(None),
        };

        for member in members {
            if member.name == name {
                return Ok(Some(MemberInfo {
                    bit_offset: offset + member.bit_offset,
                    bitfield_size: member.bitfield_size,
                    ty: member.ty,
                }));
            }
            if member.name.is_empty() {
                let found =
                    self.walk_member(member.ty, name, offset + member.bit_offset, depth + 1)?;
                if found.is_some() {
                    return Ok(found);
                }
            }
        }
        Ok(None)
    }
}

/// Shorthand to build a [`Member`].
pub fn member(name: &str, ty: TypeId, bit_offset: u32) -> Member {
    Member {
        name: name.to_string(),
        ty,
        bit_offset,
        bitfield_size: None,
    }
}

/// Shorthand to build a bitfield [`Member`].
pub fn bitfield(name: &str, ty: TypeId, bit_offset: u32, size: u32) -> Member {
    Member {
        name: name.to_string(),
        ty,
        bit_offset,
        bitfield_size: Some(size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Btf, TypeId) {
        let mut btf = Btf::new();
        let u32_t = btf.add_int("unsigned int", 4, false);
        let u8_t = btf.add_int("unsigned char", 1, false);
        let typedef = btf.add_typedef("u32", u32_t);
        let inner = btf.add_struct(
            "",
            8,
            vec![member("a", typedef, 0), bitfield("b", u8_t, 35, 3)],
        );
        let outer = btf.add_struct(
            "outer",
            16,
            vec![member("x", u32_t, 0), member("", inner, 64)],
        );
        (btf, outer)
    }

    #[test]
    fn anonymous_members() {
        let (btf, outer) = sample();
        let a = btf.find_member(outer, "a").unwrap().unwrap();
        assert_eq!(a.bit_offset, 64);
        assert_eq!(a.bitfield_size, None);
        let b = btf.find_member(outer, "b").unwrap().unwrap();
        assert_eq!(b.bit_offset, 99);
        assert_eq!(b.bitfield_size, Some(3));
        assert_eq!(btf.find_member(outer, "missing").unwrap(), None);
    }

    #[test]
    fn modifiers_are_skipped() {
        let (btf, outer) = sample();
        let a = btf.find_member(outer, "a").unwrap().unwrap();
        let resolved = btf.skip_modifiers(a.ty).unwrap();
        assert!(matches!(btf.get(resolved).unwrap(), Type::Int(i) if i.size == 4));
        assert_eq!(btf.size_of(a.ty).unwrap(), 4);
    }

    #[test]
    fn by_name() {
        let (btf, outer) = sample();
        assert_eq!(btf.resolve_struct("outer").unwrap(), outer);
        assert_eq!(
            btf.resolve_struct("u32"),
            Err(BtfError::UnknownName("u32".to_string()))
        );
    }

    #[test]
    fn self_referencing_chain_is_bounded() {
        let mut btf = Btf::new();
        let id = btf.add(Type::Void);
        btf.set(id, Type::Const(id)).unwrap();
        assert_eq!(btf.skip_modifiers(id), Err(BtfError::TooDeep(id)));
        assert!(btf.type_chain(id).is_err());
    }
}
