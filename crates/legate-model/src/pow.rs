// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Proof-of-Work challenge solving via the upstream's WebAssembly module.
//!
//! The browser backend gates every completion request behind a PoW
//! challenge solved by a wasm-bindgen module the site ships to its own web
//! client.  The allocator / stack-pointer choreography of that ABI is
//! confined to this file; the rest of the transport only sees
//! [`PowSolver::solve`] and [`pow_header`].

use std::path::Path;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use wasmtime::{Engine as WasmEngine, Instance, Memory, Module, Store, TypedFunc};

use crate::TransportError;

/// Download location for the solver module when it is missing locally.
pub const WASM_URL: &str =
    "https://fe-static.deepseek.com/chat/static/sha3_wasm_bg.7b9ca65ddd.wasm";

/// Pinned SHA-256 of the solver module.  A mismatched download is rejected.
pub const WASM_SHA256: &str = "9ffd3a88f9ad27f7b1c2e9a9e723ec4c026d5eedd1c1f4653029b6f0dda8b2cf";

/// One PoW challenge, consumed by exactly one completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowChallenge {
    pub algorithm: String,
    pub challenge: String,
    pub salt: String,
    pub expire_at: u64,
    pub difficulty: f64,
    pub signature: String,
    pub target_path: String,
}

/// Seam for the PoW computation — the health probe and the transport both
/// depend on this trait so tests can substitute an arithmetic stub.
pub trait PowSolver: Send + Sync {
    fn solve(&self, challenge: &PowChallenge) -> Result<u64, TransportError>;
}

/// Build the `x-ds-pow-response` header value: base64 of the compact JSON
/// answer object.  Field order matches the browser client.
pub fn pow_header(challenge: &PowChallenge, answer: u64) -> String {
    let body = json!({
        "algorithm": challenge.algorithm,
        "challenge": challenge.challenge,
        "salt": challenge.salt,
        "answer": answer,
        "signature": challenge.signature,
        "target_path": challenge.target_path,
    });
    B64.encode(body.to_string())
}

struct SolverInner {
    store: Store<()>,
    memory: Memory,
    alloc: TypedFunc<(i32, i32), i32>,
    stack: TypedFunc<i32, i32>,
    solve: TypedFunc<(i32, i32, i32, i32, i32, f64), ()>,
}

/// wasmtime-backed implementation of [`PowSolver`].
///
/// The store is single-threaded; one instance per transport object,
/// serialized behind a mutex.
pub struct WasmPowSolver {
    inner: Mutex<SolverInner>,
}

impl std::fmt::Debug for WasmPowSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmPowSolver").finish_non_exhaustive()
    }
}

impl WasmPowSolver {
    /// Load and validate the solver module from disk.
    ///
    /// Fails when the file is missing, empty, or does not export the
    /// expected wasm-bindgen surface (`wasm_solve`, `wasm_deepseek_hash_v1`,
    /// `memory`, allocator, stack pointer).
    pub fn load(wasm_path: &Path) -> Result<Self, TransportError> {
        let bytes = std::fs::read(wasm_path).map_err(|e| {
            TransportError::Pow(format!(
                "wasm module not found at {} ({e}); download it from {WASM_URL}",
                wasm_path.display()
            ))
        })?;
        if bytes.is_empty() {
            return Err(TransportError::Pow(format!(
                "wasm module at {} is empty; re-download it",
                wasm_path.display()
            )));
        }

        let engine = WasmEngine::default();
        let module = Module::new(&engine, &bytes)
            .map_err(|e| TransportError::Pow(format!("invalid wasm module: {e}")))?;

        // Validate the export surface before instantiating so the error
        // names what is actually missing.
        for export in ["wasm_solve", "wasm_deepseek_hash_v1", "memory"] {
            if module.get_export(export).is_none() {
                return Err(TransportError::Pow(format!(
                    "wasm module does not export '{export}'"
                )));
            }
        }

        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, &module, &[])
            .map_err(|e| TransportError::Pow(format!("wasm instantiation failed: {e}")))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| TransportError::Pow("missing 'memory' export".into()))?;
        let alloc = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, "__wbindgen_export_0")
            .map_err(|e| TransportError::Pow(format!("missing allocator export: {e}")))?;
        let stack = instance
            .get_typed_func::<i32, i32>(&mut store, "__wbindgen_add_to_stack_pointer")
            .map_err(|e| TransportError::Pow(format!("missing stack pointer export: {e}")))?;
        let solve = instance
            .get_typed_func::<(i32, i32, i32, i32, i32, f64), ()>(&mut store, "wasm_solve")
            .map_err(|e| TransportError::Pow(format!("missing wasm_solve export: {e}")))?;

        Ok(Self {
            inner: Mutex::new(SolverInner {
                store,
                memory,
                alloc,
                stack,
                solve,
            }),
        })
    }
}

impl SolverInner {
    /// Allocate and write a UTF-8 string into wasm memory; returns (ptr, len).
    fn write_string(&mut self, text: &str) -> Result<(i32, i32), TransportError> {
        let bytes = text.as_bytes();
        let len = bytes.len() as i32;
        let ptr = self
            .alloc
            .call(&mut self.store, (len, 1))
            .map_err(|e| TransportError::Pow(format!("wasm alloc failed: {e}")))?;
        self.memory
            .write(&mut self.store, ptr as usize, bytes)
            .map_err(|e| TransportError::Pow(format!("wasm memory write failed: {e}")))?;
        Ok((ptr, len))
    }

    fn read_bytes(&mut self, offset: usize, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; len];
        self.memory
            .read(&self.store, offset, &mut buf)
            .map_err(|e| TransportError::Pow(format!("wasm memory read failed: {e}")))?;
        Ok(buf)
    }

    fn solve(&mut self, challenge: &PowChallenge) -> Result<u64, TransportError> {
        let prefix = format!("{}_{}_", challenge.salt, challenge.expire_at);

        // 16-byte return slot on the wasm stack: i32 status at +0,
        // f64 nonce at +8.
        let retptr = self
            .stack
            .call(&mut self.store, -16)
            .map_err(|e| TransportError::Pow(format!("stack reserve failed: {e}")))?;

        let result = (|| {
            let (chal_ptr, chal_len) = self.write_string(&challenge.challenge)?;
            let (pre_ptr, pre_len) = self.write_string(&prefix)?;

            self.solve
                .call(
                    &mut self.store,
                    (
                        retptr,
                        chal_ptr,
                        chal_len,
                        pre_ptr,
                        pre_len,
                        challenge.difficulty,
                    ),
                )
                .map_err(|e| TransportError::Pow(format!("wasm_solve trapped: {e}")))?;

            let status_bytes = self.read_bytes(retptr as usize, 4)?;
            let status = i32::from_le_bytes([
                status_bytes[0],
                status_bytes[1],
                status_bytes[2],
                status_bytes[3],
            ]);
            if status == 0 {
                return Err(TransportError::Pow(
                    "wasm_solve returned status=0 (unsolved)".into(),
                ));
            }

            let value_bytes = self.read_bytes(retptr as usize + 8, 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&value_bytes);
            Ok(f64::from_le_bytes(raw) as u64)
        })();

        // The stack pointer must be restored on every exit path.
        let _ = self.stack.call(&mut self.store, 16);
        result
    }
}

impl PowSolver for WasmPowSolver {
    fn solve(&self, challenge: &PowChallenge) -> Result<u64, TransportError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| TransportError::Pow("solver mutex poisoned".into()))?;
        inner.solve(challenge)
    }
}

/// Verify downloaded module bytes against the pinned digest.
pub fn verify_wasm_digest(bytes: &[u8]) -> bool {
    let digest = hex::encode(Sha256::digest(bytes));
    digest == WASM_SHA256
}

/// Fetch the solver module to `wasm_path` when it does not exist yet.
///
/// The download is digest-verified before being written; a mismatch leaves
/// no file behind.
pub async fn ensure_wasm_module(
    client: &reqwest::Client,
    wasm_path: &Path,
) -> Result<(), TransportError> {
    if wasm_path.exists() {
        return Ok(());
    }
    tracing::info!(url = WASM_URL, "downloading pow solver module");
    let bytes = client
        .get(WASM_URL)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    if !verify_wasm_digest(&bytes) {
        return Err(TransportError::Pow(
            "downloaded wasm module failed digest verification".into(),
        ));
    }
    if let Some(parent) = wasm_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(wasm_path, &bytes)?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge() -> PowChallenge {
        PowChallenge {
            algorithm: "DeepSeekHashV1".into(),
            challenge: "c0ffee".into(),
            salt: "abc".into(),
            expire_at: 1_700_000_000,
            difficulty: 144_000.0,
            signature: "sig".into(),
            target_path: "/api/v0/chat/completion".into(),
        }
    }

    #[test]
    fn pow_header_is_base64_of_compact_json() {
        let header = pow_header(&challenge(), 42);
        let decoded = B64.decode(&header).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["answer"], 42);
        assert_eq!(value["algorithm"], "DeepSeekHashV1");
        assert_eq!(value["target_path"], "/api/v0/chat/completion");
        // Compact encoding — no pretty-print whitespace.
        assert!(!String::from_utf8_lossy(&decoded).contains('\n'));
    }

    #[test]
    fn challenge_deserializes_from_wire_shape() {
        let json = r#"{
            "algorithm": "DeepSeekHashV1",
            "challenge": "deadbeef",
            "salt": "s1",
            "expire_at": 1700000099,
            "difficulty": 72000,
            "signature": "sg",
            "target_path": "/api/v0/chat/completion"
        }"#;
        let c: PowChallenge = serde_json::from_str(json).unwrap();
        assert_eq!(c.salt, "s1");
        assert_eq!(c.difficulty, 72000.0);
    }

    #[test]
    fn digest_verification_rejects_other_bytes() {
        assert!(!verify_wasm_digest(b"not the module"));
    }

    #[test]
    fn loading_missing_module_fails_with_download_hint() {
        let err = WasmPowSolver::load(Path::new("/nonexistent/solver.wasm")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("download"), "got: {msg}");
    }

    #[test]
    fn loading_empty_module_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("empty.wasm");
        std::fs::write(&path, b"").unwrap();
        let err = WasmPowSolver::load(&path).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
