use std::io::Write;

use crate::Error;

pub use crate::selection::{Select, Selection};
pub use crate::signature::Signature;
pub use crate::storage::Storage;

pub trait ToWriter {
    fn to_writer<W>(&self, writer: &mut W) -> Result<(), Error>
    where
        W: Write;
}
