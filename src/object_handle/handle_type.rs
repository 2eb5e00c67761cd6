use crate::table::{HandleTypeFlags, ObjectHandle};
use crate::util::constants::HANDLE_MAX_PUBLIC_TYPES;
use enum_map::{enum_map, Enum, EnumMap};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

/// The kinds of handle a runtime can create. The discriminant is the type
/// number the handle table stores in each block.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Enum, EnumIter, Display)]
pub enum HandleType {
    /// Cleared as soon as the referent is unreachable, before finalization.
    WeakShort = 0,
    /// Cleared once the referent is unreachable after finalization.
    WeakLong = 1,
    Strong = 2,
    /// Strong, and the referent never moves.
    Pinned = 3,
    /// Behaves as one of [`VariableHandleType`], which can change at any time.
    Variable = 4,
    /// Strong while the runtime reports the native wrapper as referenced.
    RefCounted = 5,
    /// Keeps the secondary object alive while the primary is alive.
    Dependent = 6,
    /// Pinned, and also pins the objects its referent names.
    AsyncPinned = 7,
    /// Strong, and measures how many bytes its referent keeps alive.
    SizedRef = 8,
    /// A short weak handle with a native pointer attached.
    WeakInterop = 9,
}

/// How strongly a handle type holds its referent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandleStrength {
    Weak,
    Strong,
    /// Strong only while some condition holds.
    Conditional,
    /// Chosen per handle at run time.
    Dynamic,
}

/// What the handle table needs to know about a handle type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HandleTypeInfo {
    pub strength: HandleStrength,
    pub has_extra_info: bool,
    pub is_pinning: bool,
    /// Stores can make the handle keep young objects alive through something
    /// other than its referent.
    pub always_young: bool,
}

const fn info(
    strength: HandleStrength,
    has_extra_info: bool,
    is_pinning: bool,
    always_young: bool,
) -> HandleTypeInfo {
    HandleTypeInfo {
        strength,
        has_extra_info,
        is_pinning,
        always_young,
    }
}

impl HandleTypeInfo {
    fn table_flags(self) -> HandleTypeFlags {
        let mut flags = HandleTypeFlags::NONE;
        if self.has_extra_info {
            flags = flags.union(HandleTypeFlags::EXTRA_INFO);
        }
        if self.always_young {
            flags = flags.union(HandleTypeFlags::ALWAYS_YOUNG);
        }
        flags
    }
}

lazy_static! {
    static ref TYPE_INFO: EnumMap<HandleType, HandleTypeInfo> = {
        use HandleStrength::*;
        enum_map! {
            HandleType::WeakShort | HandleType::WeakLong => info(Weak, false, false, false),
            HandleType::Strong => info(Strong, false, false, false),
            HandleType::Pinned => info(Strong, false, true, false),
            HandleType::Variable => info(Dynamic, true, false, false),
            HandleType::RefCounted => info(Conditional, false, false, false),
            HandleType::Dependent => info(Conditional, true, false, true),
            HandleType::AsyncPinned => info(Strong, false, true, true),
            HandleType::SizedRef => info(Strong, true, false, false),
            HandleType::WeakInterop => info(Weak, true, false, false),
        }
    };
    static ref TYPE_FLAGS: EnumMap<HandleType, HandleTypeFlags> =
        EnumMap::from_fn(|ty| TYPE_INFO[ty].table_flags());
    static ref TYPE_NUMBERS: Vec<u8> = HandleType::iter().map(HandleType::as_u8).collect();
}

impl HandleType {
    pub const COUNT: usize = <HandleType as Enum>::LENGTH;

    pub fn info(self) -> HandleTypeInfo {
        TYPE_INFO[self]
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Declaration order matches the discriminants, so the type number is
    /// also the `Enum` index.
    pub fn from_u8(ty: u8) -> Option<HandleType> {
        ((ty as usize) < Self::COUNT).then(|| <HandleType as Enum>::from_usize(ty as usize))
    }

    /// The type of an existing handle, or `None` if its block holds a type
    /// number outside this enum.
    pub fn of(handle: ObjectHandle) -> Option<HandleType> {
        HandleType::from_u8(handle.handle_type())
    }

    /// The per-type flags handle tables for these types are created with,
    /// indexed by type number.
    pub fn type_flags() -> &'static [HandleTypeFlags] {
        TYPE_FLAGS.as_slice()
    }

    /// The type numbers of `types`.
    pub fn numbers(types: &[HandleType]) -> Vec<u8> {
        types.iter().map(|t| t.as_u8()).collect()
    }

    pub fn all() -> &'static [u8] {
        &TYPE_NUMBERS
    }
}

static_assertions::const_assert!(HandleType::COUNT <= HANDLE_MAX_PUBLIC_TYPES);

/// The behaviours a variable handle can take on. The value is kept in the
/// handle's extra info.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumIter, Display)]
pub enum VariableHandleType {
    WeakShort,
    WeakLong,
    Strong,
    Pinned,
}

impl VariableHandleType {
    pub const fn bits(self) -> usize {
        match self {
            VariableHandleType::WeakShort => 0x100,
            VariableHandleType::WeakLong => 0x200,
            VariableHandleType::Strong => 0x400,
            VariableHandleType::Pinned => 0x800,
        }
    }

    pub fn from_bits(bits: usize) -> Option<VariableHandleType> {
        VariableHandleType::iter().find(|t| t.bits() == bits)
    }
}

/// A set of [`VariableHandleType`]s, used to pick which variable handles a
/// scan treats in a given way.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VariableHandleMask(usize);

impl VariableHandleMask {
    pub const NONE: VariableHandleMask = VariableHandleMask(0);

    pub const fn of(ty: VariableHandleType) -> VariableHandleMask {
        VariableHandleMask(ty.bits())
    }

    pub const fn with(self, ty: VariableHandleType) -> VariableHandleMask {
        VariableHandleMask(self.0 | ty.bits())
    }

    /// Does the mask select a variable handle whose extra info is `bits`?
    pub fn matches(self, bits: usize) -> bool {
        self.0 & bits != 0
    }
}

/// Set the behaviour of a variable handle.
pub fn update_variable_handle_type(handle: ObjectHandle, ty: VariableHandleType) {
    debug_assert_eq!(HandleType::of(handle), Some(HandleType::Variable));
    handle.set_extra_info(HandleType::Variable.as_u8(), ty.bits());
}

/// Change the behaviour of a variable handle from `expected` to `new`.
/// Returns the behaviour the handle had before the call.
pub fn compare_exchange_variable_handle_type(
    handle: ObjectHandle,
    expected: VariableHandleType,
    new: VariableHandleType,
) -> Option<VariableHandleType> {
    debug_assert_eq!(HandleType::of(handle), Some(HandleType::Variable));
    let previous = handle.compare_exchange_extra_info(
        HandleType::Variable.as_u8(),
        expected.bits(),
        new.bits(),
    );
    VariableHandleType::from_bits(previous)
}

/// The current behaviour of a variable handle.
pub fn get_variable_handle_type(handle: ObjectHandle) -> Option<VariableHandleType> {
    debug_assert_eq!(HandleType::of(handle), Some(HandleType::Variable));
    VariableHandleType::from_bits(handle.extra_info())
}
