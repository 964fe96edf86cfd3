//! Versioned persisted models.

/// A model persisted as one row, with a version the repository bumps on
/// every write.
///
/// The booking is the only implementor. Storage adapters read the version
/// back through this trait when writing rows.
pub trait AggregateRoot {
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    /// Zero until the first persisted write.
    fn version(&self) -> u64;

    fn is_persisted(&self) -> bool {
        self.version() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BookingId;

    struct Row {
        id: BookingId,
        version: u64,
    }

    impl AggregateRoot for Row {
        type Id = BookingId;

        fn id(&self) -> &BookingId {
            &self.id
        }

        fn version(&self) -> u64 {
            self.version
        }
    }

    #[test]
    fn persisted_after_first_write() {
        let mut row = Row {
            id: BookingId::new(1),
            version: 0,
        };
        assert!(!row.is_persisted());
        row.version = 1;
        assert!(row.is_persisted());
        assert_eq!(row.id().get(), 1);
    }
}
