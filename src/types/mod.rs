//! Core identifier and classification types shared across the crate.

use bitflags::bitflags;
use std::collections::BTreeSet;

/// Arena slot index of a token.
///
/// Stable while the slot is live. Slots are recycled through the free list,
/// so a caller holding an index across mutations must also keep the token's
/// ticket and compare it on re-access (see [`crate::Token::ticket`]).
pub type TokenIdx = u32;

/// Interned file id. Id 0 is reserved for "no file" so that a zero
/// `impl_file_idx` can mean "no separate implementation site".
pub type FileIdx = u32;

/// Ordered set of token indices. Ordering keeps serialization and
/// first-match lookups deterministic.
pub type TokenIdxSet = BTreeSet<TokenIdx>;

/// Ordered set of file ids.
pub type FileIdxSet = BTreeSet<FileIdx>;

bitflags! {
    /// Classification of a token.
    ///
    /// Kept as bit flags so that kind groups ("any container",
    /// "any function") are single mask tests instead of match arms.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TokenKind: u16 {
        const NAMESPACE    = 0x0001;
        const CLASS        = 0x0002;
        const ENUM         = 0x0004;
        /// Typedefs are stored like classes inheriting from the aliased
        /// type, reusing the inheritance machinery.
        const TYPEDEF      = 0x0008;
        const CONSTRUCTOR  = 0x0010;
        const DESTRUCTOR   = 0x0020;
        const FUNCTION     = 0x0040;
        const VARIABLE     = 0x0080;
        const ENUMERATOR   = 0x0100;
        const PREPROCESSOR = 0x0200;
        const MACRO        = 0x0400;

        const ANY_CONTAINER = Self::CLASS.bits() | Self::NAMESPACE.bits() | Self::TYPEDEF.bits();
        const ANY_FUNCTION  = Self::FUNCTION.bits() | Self::CONSTRUCTOR.bits() | Self::DESTRUCTOR.bits();

        /// Undefined, or "match anything" when used as a mask.
        const UNDEFINED = 0xFFFF;
    }
}

impl TokenKind {
    /// Display string for the lowest single kind bit set.
    pub fn as_str(self) -> &'static str {
        if self.contains(Self::UNDEFINED) {
            "undefined"
        } else if self.contains(Self::NAMESPACE) {
            "namespace"
        } else if self.contains(Self::CLASS) {
            "class"
        } else if self.contains(Self::ENUM) {
            "enum"
        } else if self.contains(Self::TYPEDEF) {
            "typedef"
        } else if self.contains(Self::CONSTRUCTOR) {
            "constructor"
        } else if self.contains(Self::DESTRUCTOR) {
            "destructor"
        } else if self.contains(Self::FUNCTION) {
            "function"
        } else if self.contains(Self::VARIABLE) {
            "variable"
        } else if self.contains(Self::ENUMERATOR) {
            "enumerator"
        } else if self.contains(Self::PREPROCESSOR) {
            "preprocessor"
        } else if self.contains(Self::MACRO) {
            "macro"
        } else {
            "undefined"
        }
    }

    /// True for namespaces, classes and typedefs.
    pub fn is_container(self) -> bool {
        self.intersects(Self::ANY_CONTAINER) && !self.contains(Self::UNDEFINED)
    }

    /// True for functions, constructors and destructors.
    pub fn is_function_like(self) -> bool {
        self.intersects(Self::ANY_FUNCTION) && !self.contains(Self::UNDEFINED)
    }
}

/// Access scope of a declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TokenScope {
    #[default]
    Undefined = 0,
    Private = 1,
    Protected = 2,
    Public = 3,
}

impl TokenScope {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenScope::Undefined => "",
            TokenScope::Private => "private",
            TokenScope::Protected => "protected",
            TokenScope::Public => "public",
        }
    }

    /// Decode a wire value; unknown values collapse to `Undefined`.
    pub fn from_wire(v: i32) -> Self {
        match v {
            1 => TokenScope::Private,
            2 => TokenScope::Protected,
            3 => TokenScope::Public,
            _ => TokenScope::Undefined,
        }
    }
}

/// Parse progress of a registered file.
///
/// The "flagged for reparse" dirty marker is deliberately not a fifth
/// state: it overlays `Done` without losing the fact that the file has
/// been parsed before.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileParseStatus {
    #[default]
    NotParsed = 0,
    /// Reservation claimed by a worker, parsing not yet started.
    Assigned = 1,
    BeingParsed = 2,
    Done = 3,
}

impl FileParseStatus {
    /// Decode a wire value; unknown values collapse to `NotParsed`.
    pub fn from_wire(v: i32) -> Self {
        match v {
            1 => FileParseStatus::Assigned,
            2 => FileParseStatus::BeingParsed,
            3 => FileParseStatus::Done,
            _ => FileParseStatus::NotParsed,
        }
    }
}
