// LoanLiberator - Library Loan Archiver
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Cryptography and DRM removal
//!
//! # Protection Schemes
//! - **Archive titles** (e-books, comics): every file inside the downloaded
//!   zip is AES-CBC encrypted with a per-title key. The key is delivered
//!   wrapped and unwrapped with a key derived from the loan identity.
//! - **Segmented audiobooks**: MPEG-DASH with Widevine CENC. Only the PSSH
//!   extraction and the content-key seam live here; segment decryption is
//!   done by an external tool.

pub mod key;
pub mod stream;
pub mod tree;
pub mod widevine;

pub use key::{derive_key, key_encryption_key, FileKey, WrappedKey, BLOCK_SIZE};
pub use stream::{derive_iv, DecryptionOutcome, IvScheme, StreamCipher, DEFAULT_CHUNK_SIZE};
pub use tree::{decrypt_tree, scan_encrypted, DecryptedEntry, DecryptedTree, EncryptedFileEntry};
pub use widevine::{
    extract_pssh, CommandKeyProvider, ContentKey, ContentKeyProvider, KeyRequest,
    StaticKeyProvider, LICENSE_URL,
};
