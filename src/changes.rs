//! Counters of what an import session did to each store.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! change_counters {
    ($($field:ident),* $(,)?) => {
        /// Live counters, shared by all managers of one import session.
        #[derive(Debug, Default)]
        pub struct Changes {
            $(pub $field: AtomicU64,)*
        }

        /// Point-in-time copy of [`Changes`].
        #[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
        pub struct ChangeCounts {
            $(pub $field: u64,)*
        }

        impl Changes {
            pub fn snapshot(&self) -> ChangeCounts {
                ChangeCounts {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }

        impl fmt::Display for ChangeCounts {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut any = false;
                $(
                    if self.$field != 0 {
                        writeln!(f, "{}: {}", stringify!($field), self.$field)?;
                        any = true;
                    }
                )*
                if !any {
                    writeln!(f, "no changes")?;
                }
                Ok(())
            }
        }
    };
}

change_counters!(
    hash_data_inserted,
    hash_data_updated,
    hash_data_unchanged,
    hash_source_inserted,
    hash_source_already_present,
    hash_source_at_max,
    hash_inserted,
    hash_changed,
    hash_unchanged,
    source_data_inserted,
    source_data_updated,
    source_data_unchanged,
    source_id_inserted,
    source_id_already_present,
    source_name_inserted,
    source_name_already_present,
);

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_display() {
        let c = Changes::default();
        assert_eq!(c.snapshot().to_string(), "no changes\n");

        bump(&c.hash_inserted);
        bump(&c.hash_inserted);
        bump(&c.source_id_inserted);
        let s = c.snapshot();
        assert_eq!(s.hash_inserted, 2);
        assert_eq!(s.to_string(), "hash_inserted: 2\nsource_id_inserted: 1\n");
    }
}
