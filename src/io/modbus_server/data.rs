// src/io/modbus_server/data.rs
//
// Per-unit register storage for a server instance, and the notifier that
// reports every change to the presentation layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::events::{BackendEvent, BooleanValuePayload, RegisterValuePayload, SharedEmitter};
use crate::io::{lock, RegisterType};

/// Size of every Modbus address space.
pub const ADDRESS_SPACE: usize = 65536;

/// The four address spaces of one unit.
pub struct UnitData {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    input_registers: Vec<u16>,
    holding_registers: Vec<u16>,
}

impl Default for UnitData {
    fn default() -> Self {
        Self {
            coils: vec![false; ADDRESS_SPACE],
            discrete_inputs: vec![false; ADDRESS_SPACE],
            input_registers: vec![0; ADDRESS_SPACE],
            holding_registers: vec![0; ADDRESS_SPACE],
        }
    }
}

impl UnitData {
    /// Bit array for coils/discrete inputs, `None` for register classes.
    pub fn bits(&self, register_type: RegisterType) -> Option<&[bool]> {
        match register_type {
            RegisterType::Coils => Some(&self.coils),
            RegisterType::DiscreteInputs => Some(&self.discrete_inputs),
            _ => None,
        }
    }

    pub fn bits_mut(&mut self, register_type: RegisterType) -> Option<&mut [bool]> {
        match register_type {
            RegisterType::Coils => Some(&mut self.coils),
            RegisterType::DiscreteInputs => Some(&mut self.discrete_inputs),
            _ => None,
        }
    }

    /// Word array for holding/input registers, `None` for bit classes.
    pub fn words(&self, register_type: RegisterType) -> Option<&[u16]> {
        match register_type {
            RegisterType::HoldingRegisters => Some(&self.holding_registers),
            RegisterType::InputRegisters => Some(&self.input_registers),
            _ => None,
        }
    }

    pub fn words_mut(&mut self, register_type: RegisterType) -> Option<&mut [u16]> {
        match register_type {
            RegisterType::HoldingRegisters => Some(&mut self.holding_registers),
            RegisterType::InputRegisters => Some(&mut self.input_registers),
            _ => None,
        }
    }
}

/// Register arrays of every unit of one server instance. Units are created
/// lazily on first write.
#[derive(Clone, Default)]
pub struct ServerData {
    units: Arc<Mutex<HashMap<u8, UnitData>>>,
}

impl ServerData {
    /// Run `f` on the unit's data, creating it if needed.
    pub fn with_unit<R>(&self, unit_id: u8, f: impl FnOnce(&mut UnitData) -> R) -> R {
        let mut units = lock(&self.units);
        f(units.entry(unit_id).or_default())
    }

    /// Run `f` on the unit's data if the unit has been initialised.
    pub fn with_existing<R>(&self, unit_id: u8, f: impl FnOnce(&mut UnitData) -> R) -> Option<R> {
        lock(&self.units).get_mut(&unit_id).map(f)
    }

    pub fn unit_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = lock(&self.units).keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Emits `register-value` / `boolean-value` events for one server instance.
#[derive(Clone)]
pub struct Notifier {
    instance_id: String,
    emitter: SharedEmitter,
}

impl Notifier {
    pub fn new(instance_id: impl Into<String>, emitter: SharedEmitter) -> Self {
        Self {
            instance_id: instance_id.into(),
            emitter,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn word(&self, unit_id: u8, register_type: RegisterType, address: u16, raw: u16) {
        self.emitter.emit(BackendEvent::RegisterValue(RegisterValuePayload {
            uuid: self.instance_id.clone(),
            unit_id,
            register_type,
            address,
            raw,
        }));
    }

    pub fn bit(&self, unit_id: u8, register_type: RegisterType, address: u16, value: bool) {
        self.emitter.emit(BackendEvent::BooleanValue(BooleanValuePayload {
            uuid: self.instance_id.clone(),
            unit_id,
            register_type,
            address,
            value,
        }));
    }
}

/// Store `words` at `address` and notify each one. The caller has checked
/// the address range.
pub fn store_words(
    unit: &mut UnitData,
    notifier: &Notifier,
    unit_id: u8,
    register_type: RegisterType,
    address: u16,
    words: &[u16],
) {
    let Some(array) = unit.words_mut(register_type) else {
        return;
    };
    for (offset, &raw) in words.iter().enumerate() {
        let index = address as usize + offset;
        if index >= ADDRESS_SPACE {
            break;
        }
        array[index] = raw;
        notifier.word(unit_id, register_type, index as u16, raw);
    }
}
