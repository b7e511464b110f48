use thiserror::Error;

use crate::instructions::Instruction;

#[derive(Debug, Error)]
pub enum Z80Error {
    #[error("cpu halted")]
    Halted,

    #[error("unimplemented instruction {0:?}")]
    Unimplemented(Instruction),

    #[error("unexpected instruction {0:?} in this context")]
    UnexpectedInstruction(Instruction),

    #[error("{0}")]
    Other(String),
}

impl Z80Error {
    pub fn other(msg: impl Into<String>) -> Self {
        Z80Error::Other(msg.into())
    }
}

impl From<zxcore::Error> for Z80Error {
    fn from(err: zxcore::Error) -> Self {
        Z80Error::Other(err.to_string())
    }
}
