//! Error types for pmkit.
//!
//! Every layer reports failures through the same enum, defined in
//! `pmkit-core` and re-exported here so callers need only one import.
//!
//! | Variant        | Raised by                                          |
//! |----------------|----------------------------------------------------|
//! | `Config`       | a primitive built outside a pool, bad root object  |
//! | `Scope`        | a transactional call outside `WORK`                |
//! | `OutOfMemory`  | heap exhausted                                     |
//! | `Alloc`        | any other allocation failure                       |
//! | `Free`         | freeing a pointer the heap does not own            |
//! | `Lock`         | unlocking a lock that is not held, lock not in pool|
//! | `Aborted`      | exit of a transaction that was rolled back         |
//! | `Construct`    | a user constructor failed                          |
//! | `InvalidPool`  | bad header, size or checksum when opening          |
//! | `Io`           | mapping or flushing the pool file                  |

pub use pmkit_core::error::{Error, LockFault, Result};
