// エラー型 / error taxonomy
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2026 The denkimeter authors
//
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A `FAIL ERxx` reply from the Wi-SUN module, classified by its numeric code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkCommandError {
    #[error("unknown error code {code}: {command}")]
    UnknownError { code: u8, command: String },
    #[error("unsupported command: {command}")]
    Unsupported { command: String },
    #[error("invalid argument: {command}")]
    InvalidArgument { command: String },
    #[error("invalid syntax: {command}")]
    InvalidSyntax { command: String },
    #[error("serial input error: {command}")]
    SerialInputError { command: String },
    #[error("the command was accepted but failed to execute: {command}")]
    FailedToExecute { command: String },
}

impl SkCommandError {
    // codes are the decimal digits after "FAIL ER"
    pub fn from_code(code: u8, command: &str) -> Self {
        let command = command.to_owned();
        match code {
            4 => Self::Unsupported { command },
            5 => Self::InvalidArgument { command },
            6 => Self::InvalidSyntax { command },
            9 => Self::SerialInputError { command },
            10 => Self::FailedToExecute { command },
            _ => Self::UnknownError { code, command },
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("serial transport error: {0}")]
    Transport(#[from] io::Error),
    #[error(transparent)]
    Command(#[from] SkCommandError),
    #[error("the command timed out: {0}")]
    Timeout(String),
    #[error("could not find the specified PAN")]
    ScanFailure,
    #[error("could not establish a PANA session")]
    JoinFailure,
    #[error("{0}; close the session and open it again")]
    NeedToReopen(String),
    #[error("unexpected response: {0}")]
    ResponseNotExpected(String),
    #[error("the meter could not respond, ESV 0x{0:02X}")]
    ResponseNotPossible(u8),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("{0}")]
    Runtime(String),
}

#[test]
fn test1() {
    assert_eq!(
        SkCommandError::from_code(4, "SKSCAN"),
        SkCommandError::Unsupported {
            command: "SKSCAN".to_owned()
        }
    );
    assert_eq!(
        SkCommandError::from_code(10, "SKSENDTO"),
        SkCommandError::FailedToExecute {
            command: "SKSENDTO".to_owned()
        }
    );
    for code in [1, 2, 3, 7, 8, 11] {
        assert!(matches!(
            SkCommandError::from_code(code, "SKVER"),
            SkCommandError::UnknownError { .. }
        ));
    }
}
