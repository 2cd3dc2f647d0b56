//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。外部のストアと時刻をここで抽象化し、
//! 実装は `impls` に置きます。

pub mod clock;
pub mod id_generator;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock, to_delta};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::store::{Precondition, Row, Store, Table, all_rows};
