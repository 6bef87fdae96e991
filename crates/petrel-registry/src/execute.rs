//! Parser for LwM2M Execute argument payloads.
//!
//! Grammar: `arglist = arg *( "," arg )`, `arg = DIGIT [ "=" "'" *CHAR "'" ]`,
//! where `CHAR` is the character set the Execute section of the protocol
//! permits inside quoted values. An empty payload means "no arguments".

use petrel_domain::DmError;

/// One parsed Execute argument: a single-digit identifier with an optional
/// quoted value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecArg {
    pub id: u8,
    pub value: Option<String>,
}

fn is_value_byte(byte: u8) -> bool {
    byte == b'!'
        || (0x23..=0x26).contains(&byte)
        || (0x28..=0x5b).contains(&byte)
        || (0x5d..=0x7e).contains(&byte)
}

pub fn parse_execute_args(input: &str) -> Result<Vec<ExecArg>, DmError> {
    let bytes = input.as_bytes();
    let mut out = Vec::new();
    if bytes.is_empty() {
        return Ok(out);
    }

    let malformed = || DmError::BadRequest("malformed Execute arguments".to_string());

    let mut i = 0;
    loop {
        let digit = match bytes.get(i) {
            Some(b) if b.is_ascii_digit() => b - b'0',
            _ => return Err(malformed()),
        };
        i += 1;

        let mut value = None;
        if bytes.get(i) == Some(&b'=') {
            i += 1;
            if bytes.get(i) != Some(&b'\'') {
                return Err(malformed());
            }
            i += 1;
            let start = i;
            while let Some(&b) = bytes.get(i) {
                if b == b'\'' {
                    break;
                }
                if !is_value_byte(b) {
                    return Err(malformed());
                }
                i += 1;
            }
            if bytes.get(i) != Some(&b'\'') {
                // unterminated value
                return Err(malformed());
            }
            value = Some(input[start..i].to_string());
            i += 1;
        }

        out.push(ExecArg { id: digit, value });

        match bytes.get(i) {
            None => break,
            Some(&b',') => {
                i += 1;
                if i == bytes.len() {
                    // trailing separator
                    return Err(malformed());
                }
            }
            Some(_) => return Err(malformed()),
        }
    }
    Ok(out)
}
