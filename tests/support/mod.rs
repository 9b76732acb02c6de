#![allow(dead_code)]

//! In-process stand-in for the executor side of the call channel.
//!
//! Implements the same wire contract a real executor runtime would:
//! bootstrap resolution by well-known name, reserve/finalize/deallocate
//! memory operations, and dylib open/lookup, all over bincode payloads.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use tether::channel::bootstrap;
use tether::wire::{self, DylibHandle, FinalizeRequest, RemoteSymbolLookup, WireResult};
use tether::{ExecutorAddr, ExecutorChannel, TetherError, TetherResult};

const MEMORY_INSTANCE_ADDR: u64 = 0xa0;
const MEMORY_RESERVE_ADDR: u64 = 0xa1;
const MEMORY_FINALIZE_ADDR: u64 = 0xa2;
const MEMORY_DEALLOCATE_ADDR: u64 = 0xa3;
const REGISTER_UNWIND_ADDR: u64 = 0xa4;
const DEREGISTER_UNWIND_ADDR: u64 = 0xa5;
const DYLIB_INSTANCE_ADDR: u64 = 0xb0;
const DYLIB_OPEN_ADDR: u64 = 0xb1;
const DYLIB_LOOKUP_ADDR: u64 = 0xb2;

fn bootstrap_addr(name: &str) -> Option<u64> {
    match name {
        bootstrap::MEMORY_INSTANCE => Some(MEMORY_INSTANCE_ADDR),
        bootstrap::MEMORY_RESERVE => Some(MEMORY_RESERVE_ADDR),
        bootstrap::MEMORY_FINALIZE => Some(MEMORY_FINALIZE_ADDR),
        bootstrap::MEMORY_DEALLOCATE => Some(MEMORY_DEALLOCATE_ADDR),
        bootstrap::REGISTER_UNWIND_SECTION => Some(REGISTER_UNWIND_ADDR),
        bootstrap::DEREGISTER_UNWIND_SECTION => Some(DEREGISTER_UNWIND_ADDR),
        bootstrap::DYLIB_INSTANCE => Some(DYLIB_INSTANCE_ADDR),
        bootstrap::DYLIB_OPEN => Some(DYLIB_OPEN_ADDR),
        bootstrap::DYLIB_LOOKUP => Some(DYLIB_LOOKUP_ADDR),
        _ => None,
    }
}

#[derive(Default)]
struct State {
    next_base: u64,
    reserve_sizes: Vec<u64>,
    reserve_attempts: usize,
    finalize_requests: Vec<FinalizeRequest>,
    finalize_attempts: usize,
    deallocations: Vec<Vec<ExecutorAddr>>,
    opened: Vec<(String, u64)>,
    symbols: HashMap<String, u64>,
    fail_next_reserve: Option<String>,
    fail_next_finalize: Option<String>,
}

pub struct MockExecutor {
    page_size: u64,
    state: Mutex<State>,
}

impl MockExecutor {
    pub fn new(page_size: u64) -> Self {
        let state = State {
            next_base: 0x1000_0000,
            ..State::default()
        };
        Self {
            page_size,
            state: Mutex::new(state),
        }
    }

    pub fn with_symbols(page_size: u64, symbols: &[(&str, u64)]) -> Self {
        let mock = Self::new(page_size);
        mock.state.lock().unwrap().symbols = symbols
            .iter()
            .map(|(name, addr)| (name.to_string(), *addr))
            .collect();
        mock
    }

    /// Address this executor exports the named bootstrap symbol at.
    pub fn addr_of(&self, name: &str) -> ExecutorAddr {
        ExecutorAddr::new(bootstrap_addr(name).expect("known bootstrap name"))
    }

    pub fn fail_next_reserve(&self, message: &str) {
        self.state.lock().unwrap().fail_next_reserve = Some(message.to_string());
    }

    pub fn fail_next_finalize(&self, message: &str) {
        self.state.lock().unwrap().fail_next_finalize = Some(message.to_string());
    }

    pub fn reserve_sizes(&self) -> Vec<u64> {
        self.state.lock().unwrap().reserve_sizes.clone()
    }

    pub fn reserve_attempts(&self) -> usize {
        self.state.lock().unwrap().reserve_attempts
    }

    pub fn finalize_requests(&self) -> Vec<FinalizeRequest> {
        self.state.lock().unwrap().finalize_requests.clone()
    }

    pub fn finalize_attempts(&self) -> usize {
        self.state.lock().unwrap().finalize_attempts
    }

    pub fn deallocations(&self) -> Vec<Vec<ExecutorAddr>> {
        self.state.lock().unwrap().deallocations.clone()
    }

    pub fn opened(&self) -> Vec<(String, u64)> {
        self.state.lock().unwrap().opened.clone()
    }
}

impl ExecutorChannel for MockExecutor {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn resolve(&self, names: &[&str]) -> TetherResult<Vec<ExecutorAddr>> {
        names
            .iter()
            .map(|name| {
                bootstrap_addr(name)
                    .map(ExecutorAddr::new)
                    .ok_or_else(|| TetherError::MissingBootstrapSymbol(name.to_string()))
            })
            .collect()
    }

    fn call(&self, fn_addr: ExecutorAddr, payload: &[u8]) -> TetherResult<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        match fn_addr.value() {
            MEMORY_RESERVE_ADDR => {
                state.reserve_attempts += 1;
                let (instance, size): (ExecutorAddr, u64) = wire::decode(payload)?;
                assert_eq!(instance.value(), MEMORY_INSTANCE_ADDR);
                if let Some(message) = state.fail_next_reserve.take() {
                    return wire::encode(&WireResult::<ExecutorAddr>::Err(message));
                }
                let base = state.next_base;
                state.next_base += size.max(self.page_size);
                state.reserve_sizes.push(size);
                wire::encode(&WireResult::<ExecutorAddr>::Ok(ExecutorAddr::new(base)))
            }
            MEMORY_FINALIZE_ADDR => {
                state.finalize_attempts += 1;
                let (instance, request): (ExecutorAddr, FinalizeRequest) = wire::decode(payload)?;
                assert_eq!(instance.value(), MEMORY_INSTANCE_ADDR);
                if let Some(message) = state.fail_next_finalize.take() {
                    return wire::encode(&WireResult::<()>::Err(message));
                }
                state.finalize_requests.push(request);
                wire::encode(&WireResult::<()>::Ok(()))
            }
            MEMORY_DEALLOCATE_ADDR => {
                let (instance, bases): (ExecutorAddr, Vec<ExecutorAddr>) = wire::decode(payload)?;
                assert_eq!(instance.value(), MEMORY_INSTANCE_ADDR);
                state.deallocations.push(bases);
                wire::encode(&WireResult::<()>::Ok(()))
            }
            DYLIB_OPEN_ADDR => {
                let (instance, path, mode): (ExecutorAddr, String, u64) = wire::decode(payload)?;
                assert_eq!(instance.value(), DYLIB_INSTANCE_ADDR);
                if !Path::new(&path).exists() {
                    return wire::encode(&WireResult::<DylibHandle>::Err(format!(
                        "cannot load '{path}': no such file"
                    )));
                }
                state.opened.push((path, mode));
                wire::encode(&WireResult::<DylibHandle>::Ok(DylibHandle(
                    state.opened.len() as u64,
                )))
            }
            DYLIB_LOOKUP_ADDR => {
                let (instance, handle, lookups): (ExecutorAddr, DylibHandle, Vec<RemoteSymbolLookup>) =
                    wire::decode(payload)?;
                assert_eq!(instance.value(), DYLIB_INSTANCE_ADDR);
                if handle.0 == 0 || handle.0 as usize > state.opened.len() {
                    return wire::encode(&WireResult::<Vec<ExecutorAddr>>::Err(format!(
                        "invalid dylib handle {}",
                        handle.0
                    )));
                }
                let mut addrs = Vec::with_capacity(lookups.len());
                for lookup in &lookups {
                    match state.symbols.get(&lookup.name) {
                        Some(addr) => addrs.push(ExecutorAddr::new(*addr)),
                        None if lookup.required => {
                            return wire::encode(&WireResult::<Vec<ExecutorAddr>>::Err(format!(
                                "required symbol '{}' not found",
                                lookup.name
                            )));
                        }
                        None => addrs.push(ExecutorAddr::NULL),
                    }
                }
                wire::encode(&WireResult::<Vec<ExecutorAddr>>::Ok(addrs))
            }
            other => Err(TetherError::Channel(format!(
                "call to unknown executor function {other:#x}"
            ))),
        }
    }
}
