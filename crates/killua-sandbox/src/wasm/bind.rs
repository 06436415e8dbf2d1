//! Binding trees between host values and flat guest ABI leaves.
//!
//! A [`Binding`] describes how one host type occupies the guest calling
//! convention. Leaves are primitive slots; composites know how to rebuild
//! themselves from a fixed number of leaves. Trees are declared explicitly by
//! each type through [`WasmType`], validated once, and cached for the life of
//! the process.
//!
//! ```text
//! (WasmSlice, u32)            Tuple
//!                             ├── Slice  -> [i32, i32]
//!                             └── U32    -> [i32]
//! signature: [i32, i32, i32]
//! ```

use std::any::{type_name, TypeId};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use super::memory::MemoryView;
use super::value::{mismatch, to_signed, to_signed64, to_unsigned, to_unsigned64, WasmKind, WasmValue};
use crate::error::{Result, SandboxError};

/// Deepest composite nesting accepted at registration time.
pub const MAX_BINDING_DEPTH: usize = 16;

/// Primitive leaf types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    /// Unsigned 8-bit, the low byte of an i32 slot
    U8,
    /// Unsigned 16-bit, the low half of an i32 slot
    U16,
    /// Unsigned 32-bit, reinterpreted from an i32 slot
    U32,
    /// Signed 32-bit
    I32,
    /// Unsigned 64-bit, reinterpreted from an i64 slot
    U64,
    /// Signed 64-bit
    I64,
}

impl Primitive {
    /// The ABI slot this primitive occupies.
    pub const fn kind(self) -> WasmKind {
        match self {
            Self::U8 | Self::U16 | Self::U32 | Self::I32 => WasmKind::I32,
            Self::U64 | Self::I64 => WasmKind::I64,
        }
    }
}

/// One node of a binding tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Single primitive leaf
    Primitive(Primitive),
    /// Unsigned 32-bit guest address
    Pointer,
    /// `(pointer, length)` pair describing guest bytes
    Slice,
    /// Named, user-declared composite
    Composite {
        /// Type name used in diagnostics
        name: Cow<'static, str>,
        /// Fields in left-to-right ABI order
        fields: Vec<Binding>,
    },
    /// Anonymous grouping, used for parameter and result lists
    Tuple(Vec<Binding>),
}

impl Binding {
    /// Declare a named composite.
    pub fn composite(name: impl Into<Cow<'static, str>>, fields: Vec<Binding>) -> Self {
        Self::Composite {
            name: name.into(),
            fields,
        }
    }

    /// Number of ABI leaves this node expands to.
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Primitive(_) | Self::Pointer => 1,
            Self::Slice => 2,
            Self::Composite { fields, .. } | Self::Tuple(fields) => {
                fields.iter().map(Binding::leaf_count).sum()
            }
        }
    }

    /// Append this node's flat ABI signature.
    pub fn flatten_into(&self, out: &mut Vec<WasmKind>) {
        match self {
            Self::Primitive(p) => out.push(p.kind()),
            Self::Pointer => out.push(WasmKind::I32),
            Self::Slice => out.extend([WasmKind::I32, WasmKind::I32]),
            Self::Composite { fields, .. } | Self::Tuple(fields) => {
                for field in fields {
                    field.flatten_into(out);
                }
            }
        }
    }

    /// Flat ABI signature of this node.
    pub fn signature(&self) -> Vec<WasmKind> {
        let mut out = Vec::with_capacity(self.leaf_count());
        self.flatten_into(&mut out);
        out
    }

    /// Check the declaration is well formed.
    pub fn validate(&self) -> Result<()> {
        self.validate_at(0)
    }

    fn validate_at(&self, depth: usize) -> Result<()> {
        match self {
            Self::Primitive(_) | Self::Pointer | Self::Slice => Ok(()),
            Self::Composite { name, fields } => {
                let malformed = |reason: String| SandboxError::Binding {
                    name: name.to_string(),
                    reason,
                };
                if name.trim().is_empty() {
                    return Err(malformed("composite has no name".into()));
                }
                if fields.is_empty() {
                    return Err(malformed("composite declares no fields".into()));
                }
                if depth >= MAX_BINDING_DEPTH {
                    return Err(malformed(format!(
                        "nesting deeper than {MAX_BINDING_DEPTH} levels"
                    )));
                }
                fields.iter().try_for_each(|f| f.validate_at(depth + 1))
            }
            Self::Tuple(fields) => {
                if depth >= MAX_BINDING_DEPTH {
                    return Err(SandboxError::Binding {
                        name: "tuple".into(),
                        reason: format!("nesting deeper than {MAX_BINDING_DEPTH} levels"),
                    });
                }
                fields.iter().try_for_each(|f| f.validate_at(depth + 1))
            }
        }
    }
}

/// A validated binding together with its flattened signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingTree {
    root: Binding,
    signature: Vec<WasmKind>,
}

impl BindingTree {
    /// Validate `root` and compute its signature.
    pub fn build(root: Binding) -> Result<Self> {
        root.validate()?;
        let signature = root.signature();
        Ok(Self { root, signature })
    }

    /// Cached tree for `T`.
    ///
    /// The first call builds and validates the tree; later calls return the
    /// same `Arc`. A malformed declaration is remembered and reported on every
    /// call without being rebuilt.
    pub fn of<T: WasmType + 'static>() -> Result<Arc<BindingTree>> {
        type Cache = Mutex<HashMap<TypeId, std::result::Result<Arc<BindingTree>, (String, String)>>>;
        static CACHE: OnceLock<Cache> = OnceLock::new();

        let cache = CACHE.get_or_init(Default::default);
        let mut guard = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = guard.entry(TypeId::of::<T>()).or_insert_with(|| {
            tracing::trace!(ty = type_name::<T>(), "building binding tree");
            match BindingTree::build(T::binding()) {
                Ok(tree) => Ok(Arc::new(tree)),
                Err(SandboxError::Binding { name, reason }) => Err((name, reason)),
                Err(other) => Err((type_name::<T>().to_string(), other.to_string())),
            }
        });
        match entry {
            Ok(tree) => Ok(Arc::clone(tree)),
            Err((name, reason)) => Err(SandboxError::Binding {
                name: name.clone(),
                reason: reason.clone(),
            }),
        }
    }

    /// Root node.
    pub fn root(&self) -> &Binding {
        &self.root
    }

    /// Flat ABI signature.
    pub fn signature(&self) -> &[WasmKind] {
        &self.signature
    }

    /// Number of ABI leaves.
    pub fn leaf_count(&self) -> usize {
        self.signature.len()
    }
}

/// A host type with a declared ABI shape.
pub trait WasmType: Sized {
    /// Describe how values of this type occupy the guest ABI.
    fn binding() -> Binding;
}

/// Host values that can be flattened into ABI leaves.
pub trait WasmLower: WasmType {
    /// Append this value's leaves, left to right, recursing into fields.
    fn lower(&self, out: &mut Vec<WasmValue>) -> Result<()>;
}

/// Host values that can be rebuilt from ABI leaves.
pub trait WasmLift: WasmType {
    /// Consume exactly this type's leaves from `values`.
    ///
    /// Leaves after the ones consumed are left in the iterator.
    fn lift<I>(memory: &MemoryView<'_>, values: &mut I) -> Result<Self>
    where
        I: Iterator<Item = WasmValue>;
}

/// Pull the next leaf, failing when the stream is exhausted.
pub fn next_leaf<T, I>(values: &mut I) -> Result<WasmValue>
where
    I: Iterator<Item = WasmValue>,
{
    values.next().ok_or(SandboxError::InsufficientData {
        type_name: type_name::<T>(),
    })
}

/// Flatten `value`, checking the produced leaf count against its declaration.
pub fn lower_value<T: WasmLower + 'static>(value: &T) -> Result<Vec<WasmValue>> {
    let tree = BindingTree::of::<T>()?;
    let mut out = Vec::with_capacity(tree.leaf_count());
    value.lower(&mut out)?;
    if out.len() != tree.leaf_count() {
        return Err(SandboxError::ArgumentCount {
            expected: tree.leaf_count(),
            found: out.len(),
        });
    }
    for (kind, value) in tree.signature().iter().zip(&out) {
        if *kind != value.kind() {
            return Err(mismatch(*kind, value.kind()));
        }
    }
    Ok(out)
}

/// Rebuild a `T` from the front of `values`.
pub fn lift_value<T: WasmLift + 'static>(memory: &MemoryView<'_>, values: &[WasmValue]) -> Result<T> {
    let tree = BindingTree::of::<T>()?;
    if values.len() < tree.leaf_count() {
        return Err(SandboxError::InsufficientData {
            type_name: type_name::<T>(),
        });
    }
    let mut cursor = values.iter().copied();
    let value = T::lift(memory, &mut cursor)?;
    debug_assert_eq!(
        values.len() - cursor.len(),
        tree.leaf_count(),
        "{} lifted a different number of leaves than its binding declares",
        type_name::<T>()
    );
    Ok(value)
}

macro_rules! primitive {
    ($ty:ty, $prim:ident, $variant:ident, $to_host:expr, $to_guest:expr) => {
        impl WasmType for $ty {
            fn binding() -> Binding {
                Binding::Primitive(Primitive::$prim)
            }
        }

        impl WasmLower for $ty {
            fn lower(&self, out: &mut Vec<WasmValue>) -> Result<()> {
                out.push(WasmValue::$variant($to_guest(*self)));
                Ok(())
            }
        }

        impl WasmLift for $ty {
            fn lift<I>(_memory: &MemoryView<'_>, values: &mut I) -> Result<Self>
            where
                I: Iterator<Item = WasmValue>,
            {
                match next_leaf::<Self, I>(values)? {
                    WasmValue::$variant(raw) => Ok($to_host(raw)),
                    other => Err(mismatch(Primitive::$prim.kind(), other.kind())),
                }
            }
        }
    };
}

// Narrow slots keep only their low bits, as the canonical ABI does.
fn u8_from_slot(raw: i32) -> u8 {
    to_unsigned(raw) as u8
}

fn u16_from_slot(raw: i32) -> u16 {
    to_unsigned(raw) as u16
}

fn narrow_to_slot<T: Into<u32>>(value: T) -> i32 {
    to_signed(value.into())
}

primitive!(u8, U8, I32, u8_from_slot, narrow_to_slot);
primitive!(u16, U16, I32, u16_from_slot, narrow_to_slot);
primitive!(u32, U32, I32, to_unsigned, to_signed);
primitive!(i32, I32, I32, std::convert::identity, std::convert::identity);
primitive!(u64, U64, I64, to_unsigned64, to_signed64);
primitive!(i64, I64, I64, std::convert::identity, std::convert::identity);

macro_rules! tuple {
    ($($name:ident),*) => {
        impl<$($name: WasmType),*> WasmType for ($($name,)*) {
            fn binding() -> Binding {
                Binding::Tuple(vec![$($name::binding()),*])
            }
        }

        impl<$($name: WasmLower),*> WasmLower for ($($name,)*) {
            #[allow(non_snake_case, unused_variables)]
            fn lower(&self, out: &mut Vec<WasmValue>) -> Result<()> {
                let ($($name,)*) = self;
                $($name.lower(out)?;)*
                Ok(())
            }
        }

        impl<$($name: WasmLift),*> WasmLift for ($($name,)*) {
            #[allow(unused_variables)]
            fn lift<I>(memory: &MemoryView<'_>, values: &mut I) -> Result<Self>
            where
                I: Iterator<Item = WasmValue>,
            {
                Ok(($($name::lift(memory, values)?,)*))
            }
        }
    };
}

tuple!();
tuple!(A);
tuple!(A, B);
tuple!(A, B, C);
tuple!(A, B, C, D);
tuple!(A, B, C, D, E);
tuple!(A, B, C, D, E, F);

/// Declare a named composite from a list of fields.
///
/// The composite lowers its fields left to right and lifts them back in the
/// same order.
///
/// ```rust,ignore
/// wasm_composite!(Timestamp { seconds: u64, nanos: u32 });
/// ```
#[macro_export]
macro_rules! wasm_composite {
    ($name:ident { $($field:ident : $ty:ty),+ $(,)? }) => {
        impl $crate::wasm::WasmType for $name {
            fn binding() -> $crate::wasm::Binding {
                $crate::wasm::Binding::composite(
                    stringify!($name),
                    vec![$(<$ty as $crate::wasm::WasmType>::binding()),+],
                )
            }
        }

        impl $crate::wasm::WasmLower for $name {
            fn lower(&self, out: &mut Vec<$crate::wasm::WasmValue>) -> $crate::Result<()> {
                $($crate::wasm::WasmLower::lower(&self.$field, out)?;)+
                Ok(())
            }
        }

        impl $crate::wasm::WasmLift for $name {
            fn lift<I>(
                memory: &$crate::wasm::MemoryView<'_>,
                values: &mut I,
            ) -> $crate::Result<Self>
            where
                I: Iterator<Item = $crate::wasm::WasmValue>,
            {
                Ok(Self {
                    $($field: <$ty as $crate::wasm::WasmLift>::lift(memory, values)?,)+
                })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm::pointer::{WasmPtr, WasmSlice};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Point {
        x: u32,
        y: i64,
    }

    crate::wasm_composite!(Point { x: u32, y: i64 });

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Segment {
        from: Point,
        to: Point,
        data: WasmSlice,
    }

    crate::wasm_composite!(Segment { from: Point, to: Point, data: WasmSlice });

    struct Hollow;

    impl WasmType for Hollow {
        fn binding() -> Binding {
            Binding::composite("Hollow", vec![])
        }
    }

    struct Lying(u32);

    impl WasmType for Lying {
        fn binding() -> Binding {
            Binding::composite("Lying", vec![Binding::Primitive(Primitive::U32)])
        }
    }

    impl WasmLower for Lying {
        fn lower(&self, out: &mut Vec<WasmValue>) -> Result<()> {
            self.0.lower(out)?;
            self.0.lower(out)
        }
    }

    #[allow(dead_code)]
    struct Greedy(u32);

    impl WasmType for Greedy {
        fn binding() -> Binding {
            Binding::Primitive(Primitive::U32)
        }
    }

    impl WasmLift for Greedy {
        fn lift<I>(memory: &MemoryView<'_>, values: &mut I) -> Result<Self>
        where
            I: Iterator<Item = WasmValue>,
        {
            let first = u32::lift(memory, values)?;
            let _ = u32::lift(memory, values)?;
            Ok(Greedy(first))
        }
    }

    fn empty_memory() -> Vec<u8> {
        Vec::new()
    }

    #[test]
    fn test_leaf_count_matches_signature() {
        let bindings = [
            u32::binding(),
            WasmSlice::binding(),
            Point::binding(),
            Segment::binding(),
            <(WasmPtr, u32, (u64, WasmSlice))>::binding(),
            <()>::binding(),
        ];
        for binding in bindings {
            assert_eq!(binding.signature().len(), binding.leaf_count());
        }
        assert_eq!(
            Segment::binding().signature(),
            vec![
                WasmKind::I32,
                WasmKind::I64,
                WasmKind::I32,
                WasmKind::I64,
                WasmKind::I32,
                WasmKind::I32
            ]
        );
    }

    #[test]
    fn test_composite_round_trip() {
        let mut buf = empty_memory();
        let memory = MemoryView::new(&mut buf);
        let segment = Segment {
            from: Point { x: u32::MAX, y: -5 },
            to: Point { x: 1 << 31, y: i64::MIN },
            data: WasmSlice::new(WasmPtr::new(0x8000_0000), 12),
        };
        let leaves = lower_value(&segment).unwrap();
        assert_eq!(leaves.len(), 6);
        assert_eq!(leaves[0], WasmValue::I32(-1));
        let back: Segment = lift_value(&memory, &leaves).unwrap();
        assert_eq!(back, segment);
    }

    #[test]
    fn test_partial_consumption_and_under_supply() {
        let mut buf = empty_memory();
        let memory = MemoryView::new(&mut buf);
        let leaves = [WasmValue::I32(3), WasmValue::I64(4), WasmValue::I32(99)];
        let mut cursor = leaves.iter().copied();
        let point = Point::lift(&memory, &mut cursor).unwrap();
        assert_eq!(point, Point { x: 3, y: 4 });
        assert_eq!(cursor.next(), Some(WasmValue::I32(99)));

        let err = lift_value::<Point>(&memory, &leaves[..1]).unwrap_err();
        assert!(matches!(err, SandboxError::InsufficientData { .. }));
        let err = Point::lift(&memory, &mut leaves[..1].iter().copied()).unwrap_err();
        assert!(err.to_string().contains("insufficient wasm data"));
    }

    #[test]
    fn test_kind_mismatch_on_lift() {
        let mut buf = empty_memory();
        let memory = MemoryView::new(&mut buf);
        let err = lift_value::<Point>(&memory, &[WasmValue::I32(1), WasmValue::I32(2)]).unwrap_err();
        assert!(matches!(err, SandboxError::KindMismatch { .. }));
    }

    #[test]
    fn test_malformed_composite_is_cached_error() {
        let first = BindingTree::of::<Hollow>().unwrap_err();
        let second = BindingTree::of::<Hollow>().unwrap_err();
        assert!(matches!(first, SandboxError::Binding { ref name, .. } if name == "Hollow"));
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn test_arity_mismatch_on_lower() {
        let err = lower_value(&Lying(1)).unwrap_err();
        assert!(matches!(err, SandboxError::ArgumentCount { expected: 1, found: 2 }));
    }

    #[test]
    fn test_cache_returns_same_tree() {
        let a = BindingTree::of::<(WasmSlice, u32)>().unwrap();
        let b = BindingTree::of::<(WasmSlice, u32)>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.signature(), &[WasmKind::I32; 3]);
    }

    #[test]
    fn test_depth_limit() {
        let mut binding = Binding::Primitive(Primitive::U32);
        for _ in 0..=MAX_BINDING_DEPTH {
            binding = Binding::composite("Nested", vec![binding]);
        }
        assert!(binding.validate().is_err());
    }

    #[test]
    fn test_narrow_primitives() {
        let mut buf = empty_memory();
        let memory = MemoryView::new(&mut buf);
        assert_eq!(u8::binding().signature(), vec![WasmKind::I32]);
        assert_eq!(u16::binding().signature(), vec![WasmKind::I32]);

        let leaves = lower_value(&(0xABu8, 0xBEEFu16)).unwrap();
        assert_eq!(leaves, vec![WasmValue::I32(0xAB), WasmValue::I32(0xBEEF)]);
        assert_eq!(lift_value::<(u8, u16)>(&memory, &leaves).unwrap(), (0xAB, 0xBEEF));

        // High bits of the slot are dropped
        assert_eq!(lift_value::<u8>(&memory, &[WasmValue::I32(0x1FF)]).unwrap(), 0xFF);
        assert_eq!(lift_value::<u16>(&memory, &[WasmValue::I32(-1)]).unwrap(), u16::MAX);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "different number of leaves")]
    fn test_miscounted_lift_is_caught() {
        let mut buf = empty_memory();
        let memory = MemoryView::new(&mut buf);
        let _ = lift_value::<Greedy>(&memory, &[WasmValue::I32(1), WasmValue::I32(2)]);
    }
}
