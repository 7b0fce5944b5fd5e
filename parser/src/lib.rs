pub mod analyzer;
pub mod bitfield;
pub mod dispatch;
mod error;
pub mod packet;
pub mod replay_file;
pub mod types;

pub use error::*;
pub use replay_file::*;
pub use strum;

pub type IResult<I, O> = nom::IResult<I, O>;
