use crate::meter_state::{MeterPaths, StateHandle, Value, WriteOutcome};
use std::future;
use tokio::net::TcpListener;
use tokio_modbus::{
    prelude::*,
    server::tcp::{accept_tcp_connection, Server},
};
use tracing::{debug, info, warn};

/// Holding register carrying the update index.
pub const UPDATE_INDEX_REGISTER: u16 = 0;
/// First of the f32 registers; each value takes two, high word first.
pub const FIRST_FLOAT_REGISTER: u16 = 1;
const FLOAT_COUNT: u16 = 8;
pub const LAST_REGISTER: u16 = FIRST_FLOAT_REGISTER + FLOAT_COUNT * 2 - 1;

/// Measurement path served at the f32 starting at `base`.
fn float_path(paths: &MeterPaths, base: u16) -> Option<&str> {
    let path = match base {
        1 => &paths.power,
        3 => &paths.energy_forward,
        5 => &paths.energy_reverse,
        7 => &paths.line_voltage,
        9 => &paths.line_current,
        11 => &paths.line_power,
        13 => &paths.line_energy_forward,
        15 => &paths.line_energy_reverse,
        _ => return None,
    };
    Some(path.as_str())
}

/// Exposes the published state as a Modbus TCP holding register map.
#[derive(Clone)]
pub struct MeterModbusService {
    state: StateHandle,
}

impl MeterModbusService {
    pub fn new(state: StateHandle) -> Self {
        Self { state }
    }

    fn read_registers(&self, addr: u16, cnt: u16) -> Result<Vec<u16>, ExceptionCode> {
        let end = addr
            .checked_add(cnt)
            .filter(|end| cnt > 0 && *end <= LAST_REGISTER + 1)
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        let state = self.state.lock();
        let mut values = Vec::with_capacity(cnt.into());
        for register in addr..end {
            if register == UPDATE_INDEX_REGISTER {
                values.push(state.update_index().into());
                continue;
            }
            let offset = (register - FIRST_FLOAT_REGISTER) % 2;
            let base = register - offset;
            let value = float_path(state.paths(), base)
                .and_then(|path| state.get_f64(path))
                .unwrap_or_default() as f32;
            let bits = value.to_bits();
            values.push(if offset == 0 {
                (bits >> 16) as u16
            } else {
                (bits & 0xFFFF) as u16
            });
        }
        Ok(values)
    }

    fn write_registers(&self, addr: u16, words: &[u16]) -> Result<(), ExceptionCode> {
        let aligned = addr >= FIRST_FLOAT_REGISTER
            && (addr - FIRST_FLOAT_REGISTER) % 2 == 0
            && !words.is_empty()
            && words.len() % 2 == 0
            && usize::from(addr) + words.len() <= usize::from(LAST_REGISTER) + 1;
        if !aligned {
            warn!("rejected Modbus write of {} registers at {addr}", words.len());
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let mut state = self.state.lock();
        for (pair, base) in words.chunks_exact(2).zip((addr..).step_by(2)) {
            let value = f32::from_bits((u32::from(pair[0]) << 16) | u32::from(pair[1]));
            let Some(path) = float_path(state.paths(), base).map(str::to_string) else {
                return Err(ExceptionCode::IllegalDataAddress);
            };
            if state.set(&path, Value::Float(value.into())) == WriteOutcome::Rejected {
                return Err(ExceptionCode::IllegalDataValue);
            }
        }
        Ok(())
    }
}

impl tokio_modbus::server::Service for MeterModbusService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadHoldingRegisters(addr, cnt) => {
                debug!("holding register read for {addr}/{cnt}");
                self.read_registers(addr, cnt)
                    .map(Response::ReadHoldingRegisters)
            }
            Request::ReadInputRegisters(addr, cnt) => {
                debug!("input register read for {addr}/{cnt}");
                self.read_registers(addr, cnt)
                    .map(Response::ReadInputRegisters)
            }
            Request::WriteMultipleRegisters(addr, words) => self
                .write_registers(addr, &words)
                .map(|()| Response::WriteMultipleRegisters(addr, words.len() as u16)),
            Request::WriteSingleRegister(addr, _) => {
                warn!("rejected single register write at {addr}");
                Err(ExceptionCode::IllegalDataAddress)
            }
            _ => {
                warn!("unimplemented function code in request: {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

/// Serves the published state until the listener fails.
pub async fn serve(listener: TcpListener, state: StateHandle) -> anyhow::Result<()> {
    info!("serving published state over Modbus TCP on {}", listener.local_addr()?);
    let server = Server::new(listener);
    let service = MeterModbusService::new(state);
    let new_service = |_socket_addr| Ok(Some(service.clone()));
    let on_connected = |stream, socket_addr| async move {
        accept_tcp_connection(stream, socket_addr, new_service)
    };
    let on_process_error = |err| {
        warn!("Modbus server error: {err}");
    };
    server.serve(&on_connected, on_process_error).await?;
    Ok(())
}
