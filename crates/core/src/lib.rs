pub mod clock;
pub mod earnings;
pub mod enums;
pub mod error;
pub mod ids;
pub mod personnel;
pub mod proposal;
pub mod row;
pub mod task;
