// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

//! Command integrity code.
//!
//! The checksum is the wrapping (mod 256) sum of `code`, `type`, `size` and
//! the first `size` payload bytes. Bytes beyond `size` are always zero on the
//! wire so they would not change the sum anyway.

use crate::Command;

pub fn checksum(code: u8, cmd_type: u8, size: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(code.wrapping_add(cmd_type).wrapping_add(size), |acc, &b| {
            acc.wrapping_add(b)
        })
}

impl Command {
    pub fn compute_checksum(&self) -> u8 {
        checksum(self.code, self.cmd_type, self.size(), self.data())
    }

    /// Stores the checksum computed over the current contents.
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn validate(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}
