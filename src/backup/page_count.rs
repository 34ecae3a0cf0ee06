use derive_more::Display;
use serde::de::{Error as DeError, Unexpected, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ffi::c_int;
use std::fmt::Formatter;
use std::num::NonZeroU32;
use std::result;

/// How many pages a single step may copy.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum PageCount {
    /// Copy at most this many pages, then report what remains.
    #[display("{_0} pages")]
    Pages(NonZeroU32),
    /// Copy everything that remains in one round.
    #[display("all pages")]
    All,
}

impl PageCount {
    /// `None` for zero, since a step always has to make room for progress.
    pub fn pages(n: u32) -> Option<Self> {
        NonZeroU32::new(n).map(Self::Pages)
    }

    /// The value handed to the native step call; negative means unbounded.
    pub fn as_native(self) -> c_int {
        match self {
            PageCount::Pages(n) => c_int::try_from(n.get()).unwrap_or(c_int::MAX),
            PageCount::All => -1,
        }
    }
}

impl From<NonZeroU32> for PageCount {
    fn from(value: NonZeroU32) -> Self {
        Self::Pages(value)
    }
}

impl From<Option<NonZeroU32>> for PageCount {
    fn from(value: Option<NonZeroU32>) -> Self {
        value.map_or(Self::All, Self::Pages)
    }
}

impl Serialize for PageCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> result::Result<S::Ok, S::Error> {
        match self {
            PageCount::Pages(n) => serializer.serialize_u32(n.get()),
            PageCount::All => serializer.serialize_str("all"),
        }
    }
}

struct PageCountVisitor;

impl Visitor<'_> for PageCountVisitor {
    type Value = PageCount;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a positive page count or \"all\"")
    }

    fn visit_u64<E: DeError>(self, v: u64) -> result::Result<Self::Value, E> {
        u32::try_from(v)
            .ok()
            .and_then(PageCount::pages)
            .ok_or_else(|| E::invalid_value(Unexpected::Unsigned(v), &self))
    }

    fn visit_i64<E: DeError>(self, v: i64) -> result::Result<Self::Value, E> {
        u64::try_from(v)
            .map_err(|_| E::invalid_value(Unexpected::Signed(v), &self))
            .and_then(|v| self.visit_u64(v))
    }

    fn visit_str<E: DeError>(self, v: &str) -> result::Result<Self::Value, E> {
        if v.eq_ignore_ascii_case("all") {
            Ok(PageCount::All)
        } else {
            Err(E::invalid_value(Unexpected::Str(v), &self))
        }
    }
}

impl<'de> Deserialize<'de> for PageCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_any(PageCountVisitor)
    }
}
