// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use tracing::error;

/// Renders a device status code. Codes whose four big-endian bytes are all
/// printable ASCII read as a quoted tag (`'fmt?'`); anything else is decimal.
pub fn status_tag(code: i32) -> String {
    let bytes = code.to_be_bytes();
    if bytes.iter().all(|b| (0x20..=0x7e).contains(b)) {
        format!("'{}'", bytes.iter().map(|b| *b as char).collect::<String>())
    } else {
        code.to_string()
    }
}

/// Passes a zero status through and logs anything else against the operation.
pub fn check(code: i32, operation: &str) -> Result<(), i32> {
    if code == 0 {
        return Ok(());
    }
    error!(operation, status = status_tag(code), "Device operation failed");
    Err(code)
}
