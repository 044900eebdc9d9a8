//! Memoized call interfaces for variadic signatures.
//!
//! A variadic signature is not fixed, so a single prepared interface cannot
//! cover it. `VariadicFunction` builds one `(CallInterface, Invoker)` pair
//! per observed combination of trailing argument types and reuses it for
//! every later call with the same combination. Keys are content-based:
//! structurally equal descriptors collapse to the same entry no matter
//! which instances the caller supplies.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::abi::Abi;
use crate::call::{FnAddr, Invoker};
use crate::cif::CallInterface;
use crate::error::Error;
use crate::types::TypeDesc;

pub struct VariadicFunction {
    addr: FnAddr,
    ret: TypeDesc,
    fixed: Vec<TypeDesc>,
    abi: Option<Abi>,
    /// Signature key -> bound invoker. Entries live as long as the
    /// generator; call-site signatures are drawn from a small finite set in
    /// practice, so there is no eviction. Misses only occur on the managed
    /// thread, so the lock is uncontended.
    cache: Mutex<HashMap<[u8; 32], Arc<Invoker>>>,
}

impl VariadicFunction {
    pub fn new(addr: FnAddr, ret: TypeDesc, fixed: Vec<TypeDesc>, abi: Option<Abi>) -> Self {
        Self { addr, ret, fixed, abi, cache: Mutex::new(HashMap::new()) }
    }

    /// The invoker for this trailing-type combination, built on first use.
    pub fn bind(&self, trailing: &[TypeDesc]) -> Result<Arc<Invoker>, Error> {
        self.bind_returning(&self.ret, trailing)
    }

    /// Like `bind`, for the rare function whose return type also varies
    /// between call sites. The return type is part of every cache key.
    pub fn bind_returning(
        &self,
        ret: &TypeDesc,
        trailing: &[TypeDesc],
    ) -> Result<Arc<Invoker>, Error> {
        let key = signature_key(ret, &self.fixed, trailing);
        if let Some(hit) = self.cache.lock().get(&key) {
            tracing::trace!(target: "variadic", "signature cache hit");
            return Ok(hit.clone());
        }

        let mut args = self.fixed.clone();
        args.extend_from_slice(trailing);
        let iface = CallInterface::build_variadic(ret, &args, self.fixed.len(), self.abi)?;
        let invoker = Arc::new(Invoker::new(iface, self.addr));

        let mut cache = self.cache.lock();
        let entry = cache.entry(key).or_insert(invoker);
        Ok(entry.clone())
    }

    #[inline]
    pub fn address(&self) -> FnAddr {
        self.addr
    }

    #[inline]
    pub fn fixed_arg_types(&self) -> &[TypeDesc] {
        &self.fixed
    }
}

/// Return-type token first, then every argument token in order.
fn signature_key(ret: &TypeDesc, fixed: &[TypeDesc], trailing: &[TypeDesc]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&ret.cache_key());
    for desc in fixed.iter().chain(trailing) {
        hasher.update(&desc.cache_key());
    }
    *hasher.finalize().as_bytes()
}
