//! MSE4 storage layout (pure)
//!
//! Translates provisioned [`MountAssignment`]s into a [`LayoutPlan`]: one
//! book and one store per location, in discovery order, then renders the
//! plan as `mse4.conf`.
//!
//! # Capacity math
//!
//! ```text
//! store_gib   = floor((capacity_bytes / 2^30 - 8) * 0.98)
//! store_bytes = store_gib * 2^30
//! book_bytes  = 8 * 2^30
//! ```
//!
//! Computed in integer arithmetic so the floor is exact. A result of zero or
//! less is rejected, never clamped.
//!
//! # Design
//!
//! - **Pure logic**: no I/O. The caller writes the rendered text.
//! - **Deterministic**: same assignments, same plan, same bytes (given the same header timestamp).

use crate::storage::{GIB, MountAssignment};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Metadata book size per location
pub const BOOK_SIZE_GIB: u64 = 8;

/// Share of the remaining capacity given to the store, in percent
pub const STORE_FILL_PERCENT: u64 = 98;

/// File names of the book and store inside each base path
pub const BOOK_FILE: &str = "book";
pub const STORE_FILE: &str = "store";

/// Where containers see the numbered storage directories
pub const CONTAINER_STORAGE_ROOT: &str = "/var/lib/mse";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("{identifier} ({capacity_bytes} bytes) leaves no room for a store after the {BOOK_SIZE_GIB} GiB book")]
    CapacityTooSmall { identifier: String, capacity_bytes: u64 },

    #[error("{0} has no resolved stable identifier")]
    UnresolvedStableId(String),

    #[error("No storage locations to lay out")]
    Empty,
}

/// How book and store file paths are expressed in the config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasePathScheme {
    /// Host paths: the mount point or directory itself (hybrid)
    Host,
    /// Container paths `/var/lib/mse/diskN` (docker)
    Container,
}

/// Store size in whole GiB for a location of `capacity_bytes`
pub fn store_size_gib(capacity_bytes: u64) -> Option<u64> {
    let reserved = BOOK_SIZE_GIB * GIB;
    if capacity_bytes <= reserved {
        return None;
    }
    let remaining = (capacity_bytes - reserved) as u128;
    let gib = (remaining * STORE_FILL_PERCENT as u128) / (100 * GIB as u128);
    match gib {
        0 => None,
        n => Some(n as u64),
    }
}

/// One book with its single store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookEntry {
    pub id: String,
    pub base_path: PathBuf,
    pub book_size_bytes: u64,
    pub store_id: String,
    pub store_size_bytes: u64,
}

impl BookEntry {
    pub fn book_file(&self) -> PathBuf {
        self.base_path.join(BOOK_FILE)
    }

    pub fn store_file(&self) -> PathBuf {
        self.base_path.join(STORE_FILE)
    }

    pub fn store_size_gib(&self) -> u64 {
        self.store_size_bytes / GIB
    }
}

impl fmt::Display for BookEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {} (book {}G, {} {}G)",
            self.id,
            self.base_path.display(),
            self.book_size_bytes / GIB,
            self.store_id,
            self.store_size_gib()
        )
    }
}

/// Ordered storage layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutPlan {
    pub books: Vec<BookEntry>,
}

impl LayoutPlan {
    pub fn total_store_bytes(&self) -> u64 {
        self.books.iter().map(|b| b.store_size_bytes).sum()
    }

    /// Base paths in book order
    pub fn base_paths(&self) -> Vec<PathBuf> {
        self.books.iter().map(|b| b.base_path.clone()).collect()
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} book(s), {} GiB of store capacity\n",
            self.books.len(),
            self.total_store_bytes() / GIB
        );
        for book in &self.books {
            out.push_str(&format!("  {}\n", book));
        }
        out
    }

    /// Render as `mse4.conf`
    pub fn render_mse4_conf(&self, generated_at: &str) -> String {
        let mut out = format!(
            "# MSE4 Configuration\n# Generated by teamcache-deploy on {}\n# Number of devices: {}\n\nenv: {{\n        books = ( {{\n",
            generated_at,
            self.books.len()
        );

        for (i, book) in self.books.iter().enumerate() {
            if i > 0 {
                out.push_str("        }, {\n");
            }
            out.push_str(&format!(
                concat!(
                    "                id = \"{}\";\n",
                    "                filename = \"{}\";\n",
                    "                size = \"{}G\";\n",
                    "\n",
                    "                stores = ( {{\n",
                    "                        id = \"{}\";\n",
                    "                        filename = \"{}\";\n",
                    "                        size = \"{}G\";\n",
                    "                }} );\n",
                ),
                book.id,
                book.book_file().display(),
                book.book_size_bytes / GIB,
                book.store_id,
                book.store_file().display(),
                book.store_size_gib(),
            ));
        }

        out.push_str("        } );\n   };\n");
        out
    }
}

/// Derive the layout for `assignments`, in order
pub fn generate(assignments: &[MountAssignment], scheme: BasePathScheme) -> Result<LayoutPlan, LayoutError> {
    if assignments.is_empty() {
        return Err(LayoutError::Empty);
    }

    let mut books = Vec::with_capacity(assignments.len());
    for (i, assignment) in assignments.iter().enumerate() {
        let n = i + 1;
        let desc = &assignment.descriptor;

        if desc.stable_id().is_none() {
            return Err(LayoutError::UnresolvedStableId(desc.identifier().to_string()));
        }

        let store_gib = store_size_gib(desc.capacity_bytes()).ok_or_else(|| LayoutError::CapacityTooSmall {
            identifier: desc.identifier().to_string(),
            capacity_bytes: desc.capacity_bytes(),
        })?;

        let base_path = match scheme {
            BasePathScheme::Host => assignment.mount_point.clone(),
            BasePathScheme::Container => PathBuf::from(CONTAINER_STORAGE_ROOT).join(format!("disk{}", n)),
        };

        books.push(BookEntry {
            id: format!("book{}", n),
            base_path,
            book_size_bytes: BOOK_SIZE_GIB * GIB,
            store_id: format!("store{}", n),
            store_size_bytes: store_gib * GIB,
        });
    }

    Ok(LayoutPlan { books })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StableId, StorageDescriptor};
    use crate::types::DeviceMode;

    fn assignment(dev: &str, gib: u64, mp: &str) -> MountAssignment {
        MountAssignment {
            descriptor: StorageDescriptor::raw_device(dev, gib * GIB, Some("xfs".into()), DeviceMode::Format)
                .with_stable_id(StableId::Uuid(format!("uuid-{}", gib))),
            mount_point: PathBuf::from(mp),
            already_active: false,
        }
    }

    // ========================================================================
    // Capacity math
    // ========================================================================

    #[test]
    fn test_store_size_reference_values() {
        assert_eq!(store_size_gib(100 * GIB), Some(90));
        assert_eq!(store_size_gib(500 * GIB), Some(482));
        assert_eq!(store_size_gib(10 * GIB), Some(1));
    }

    #[test]
    fn test_store_size_rejects_small() {
        assert_eq!(store_size_gib(8 * GIB), None);
        assert_eq!(store_size_gib(9 * GIB), None, "0.98 GiB floors to zero");
        assert_eq!(store_size_gib(0), None);
    }

    #[test]
    fn test_store_size_exact_boundary() {
        // (58 - 8) * 0.98 = 49 exactly
        assert_eq!(store_size_gib(58 * GIB), Some(49));
    }

    // ========================================================================
    // Plan generation
    // ========================================================================

    #[test]
    fn test_generate_hybrid_uses_mount_points() {
        let plan = generate(
            &[assignment("/dev/sdb", 100, "/cache/disk1"), assignment("/dev/sdc", 500, "/cache/disk2")],
            BasePathScheme::Host,
        )
        .unwrap();

        assert_eq!(plan.books.len(), 2);
        assert_eq!(plan.books[0].id, "book1");
        assert_eq!(plan.books[0].store_size_gib(), 90);
        assert_eq!(plan.books[0].base_path, PathBuf::from("/cache/disk1"));
        assert_eq!(plan.books[1].store_id, "store2");
        assert_eq!(plan.books[1].store_size_gib(), 482);
        assert_eq!(plan.books[1].book_size_bytes, 8 * GIB);
    }

    #[test]
    fn test_generate_docker_uses_container_paths() {
        let plan = generate(&[assignment("/dev/sdb", 100, "/cache/disk1")], BasePathScheme::Container).unwrap();
        assert_eq!(plan.books[0].base_path, PathBuf::from("/var/lib/mse/disk1"));
    }

    #[test]
    fn test_generate_rejects_unresolved_stable_id() {
        let unresolved = MountAssignment {
            descriptor: StorageDescriptor::raw_device("/dev/sdb", 100 * GIB, None, DeviceMode::Format),
            mount_point: PathBuf::from("/cache/disk1"),
            already_active: false,
        };
        assert_eq!(
            generate(&[unresolved], BasePathScheme::Host),
            Err(LayoutError::UnresolvedStableId("/dev/sdb".into()))
        );
    }

    #[test]
    fn test_generate_rejects_small_capacity() {
        let small = assignment("/dev/sdb", 8, "/cache/disk1");
        assert!(matches!(
            generate(&[small], BasePathScheme::Host),
            Err(LayoutError::CapacityTooSmall { .. })
        ));
    }

    #[test]
    fn test_generate_empty_is_error() {
        assert_eq!(generate(&[], BasePathScheme::Host), Err(LayoutError::Empty));
    }

    #[test]
    fn test_generate_is_deterministic() {
        let input = [assignment("/dev/sdb", 100, "/cache/disk1"), assignment("/dev/sdc", 250, "/cache/disk2")];
        let a = generate(&input, BasePathScheme::Host).unwrap();
        let b = generate(&input, BasePathScheme::Host).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.render_mse4_conf("T"), b.render_mse4_conf("T"));
    }

    // ========================================================================
    // Rendering
    // ========================================================================

    #[test]
    fn test_render_single_book() {
        let plan = generate(&[assignment("/dev/sdb", 100, "/cache/disk1")], BasePathScheme::Host).unwrap();
        let expected = "\
# MSE4 Configuration
# Generated by teamcache-deploy on 2026-01-01 00:00:00
# Number of devices: 1

env: {
        books = ( {
                id = \"book1\";
                filename = \"/cache/disk1/book\";
                size = \"8G\";

                stores = ( {
                        id = \"store1\";
                        filename = \"/cache/disk1/store\";
                        size = \"90G\";
                } );
        } );
   };
";
        assert_eq!(plan.render_mse4_conf("2026-01-01 00:00:00"), expected);
    }

    #[test]
    fn test_render_separates_books() {
        let plan = generate(
            &[assignment("/dev/sdb", 100, "/cache/disk1"), assignment("/dev/sdc", 500, "/cache/disk2")],
            BasePathScheme::Host,
        )
        .unwrap();
        let text = plan.render_mse4_conf("T");

        assert_eq!(text.matches("        }, {\n").count(), 1);
        let first = text.find("book1").unwrap();
        let second = text.find("book2").unwrap();
        assert!(first < second);
        assert!(text.contains("size = \"482G\";"));
        assert!(text.ends_with("        } );\n   };\n"));
    }
}
