use std::hash::Hash;
use std::marker::PhantomData;

pub trait IntUid: Copy + Eq + Ord + Hash {
    type Raw;
    fn from_raw(raw: Self::Raw) -> Self;
    fn raw(&self) -> Self::Raw;
}

/// Hands out ids in increasing order.  A generator never hands out the same id twice, so an
/// id which has been released stays dead for the lifetime of its owner.
#[derive(Debug, Clone)]
pub struct UidGen<T> {
    next: u32,
    _marker: PhantomData<T>,
}

impl<T> Default for UidGen<T> {
    fn default() -> Self {
        UidGen { next: 0, _marker: PhantomData }
    }
}

impl<T: IntUid<Raw = u32>> UidGen<T> {
    pub fn next_id(&mut self) -> T {
        let id = T::from_raw(self.next);
        self.next += 1;
        id
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> u32 { self.next }
}

#[macro_export]
macro_rules! define_u32_id_type {
    ($name:ident) => {
        #[derive(PartialEq, Eq, Hash, Copy, Clone, Debug, Ord, PartialOrd)]
        pub struct $name(u32);

        impl $crate::IntUid for $name {
            type Raw = u32;

            fn from_raw(raw: u32) -> Self {
                return Self(raw)
            }

            fn raw(&self) -> u32 {
                return self.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    define_u32_id_type!(TestId);

    #[test]
    fn ids_are_never_reused() {
        let mut gen = UidGen::<TestId>::default();
        let a = gen.next_id();
        let b = gen.next_id();
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(b.raw(), 1);
        assert_eq!(gen.issued(), 2);
    }
}
