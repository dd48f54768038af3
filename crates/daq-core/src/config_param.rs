//! ConfigParam - desired/effective parameter pairs with an arm-time snapshot.
//!
//! An acquisition configuration parameter is a pair of table entries:
//!
//! - `DESIRED_<name>`: what the operator (or, for *internal* parameters, the
//!   driver) asks for. May change at any time.
//! - `EFFECTIVE_<name>`: what the running acquisition actually uses.
//!   Write-protected; only the framework publishes it.
//!
//! plus a private *snapshot* of the desired value. At the start of every arm
//! cycle the framework copies each desired value into its snapshot; from then
//! on drivers only read the snapshot, which cannot drift no matter how the
//! desired value is rewritten mid-acquisition.
//!
//! # Snapshot Window
//!
//! ```text
//!   Closed ──begin_settings_check──▶ Checking ──freeze_snapshots──▶ Frozen
//!     ▲                                  │                            │
//!     └──────────close_snapshot_window───┴────────────────────────────┘
//! ```
//!
//! - Snapshots are readable in `Checking` and `Frozen`.
//! - `set_irrelevant` / `set_snapshot` are only legal in `Checking`, i.e.
//!   from inside the driver's settings check.
//!
//! Violations of the window are programming errors and panic.
//!
//! # Supported Type Pairs
//!
//! `ConfigParam<i32>`, `ConfigParam<f64>` and `ConfigParam<i32, f64>` (the
//! latter allows NaN as the invalid effective value for an integer setting).

use std::marker::PhantomData;

use crate::error::ParamError;
use crate::parameter::{ParamId, ParamKind, ParamTable, ParamValue};

/// Value types usable for desired/snapshot/effective values.
pub trait ConfigValue: Copy + PartialEq + Default + std::fmt::Debug + Send + Sync + 'static {
    const KIND: ParamKind;

    fn into_value(self) -> ParamValue;

    fn from_value(value: &ParamValue) -> Option<Self>;
}

impl ConfigValue for i32 {
    const KIND: ParamKind = ParamKind::Int;

    fn into_value(self) -> ParamValue {
        ParamValue::Int(self)
    }

    fn from_value(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl ConfigValue for f64 {
    const KIND: ParamKind = ParamKind::Float;

    fn into_value(self) -> ParamValue {
        ParamValue::Float(self)
    }

    fn from_value(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(f64::from(*v)),
            ParamValue::Text(_) => None,
        }
    }
}

/// Phase of the snapshot window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotPhase {
    /// Snapshots are stale and must not be read.
    #[default]
    Closed,
    /// Settings are being checked; snapshots may be adjusted.
    Checking,
    /// Settings were accepted; snapshots are frozen until acquisition stops.
    Frozen,
}

#[derive(Debug)]
struct ConfigSlot {
    base_name: String,
    desired: ParamId,
    effective: ParamId,
    internal: bool,
    irrelevant: bool,
    snapshot: ParamValue,
    invalid: ParamValue,
}

impl ConfigSlot {
    fn effective_kind(&self) -> ParamKind {
        self.invalid.kind()
    }

    /// Snapshot converted to the effective value type.
    fn snapshot_as_effective(&self) -> ParamValue {
        match (&self.snapshot, self.effective_kind()) {
            (ParamValue::Int(v), ParamKind::Float) => ParamValue::Float(f64::from(*v)),
            (value, _) => value.clone(),
        }
    }
}

/// All configuration parameters of a table plus the snapshot window state.
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    slots: Vec<ConfigSlot>,
    phase: SnapshotPhase,
}

/// Typed handle to a configuration parameter registered in a [`ParamTable`].
///
/// Handles are plain indices and are `Copy`; all state lives in the table so
/// every access goes through the port lock that guards it.
#[derive(Debug)]
pub struct ConfigParam<V, E = V> {
    slot: usize,
    desired: ParamId,
    effective: ParamId,
    _marker: PhantomData<fn() -> (V, E)>,
}

impl<V, E> Clone for ConfigParam<V, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V, E> Copy for ConfigParam<V, E> {}

impl ParamTable {
    /// Register a configuration parameter named `base_name`.
    ///
    /// Creates `DESIRED_<base_name>` (left undefined, write-protected if
    /// `internal`) and `EFFECTIVE_<base_name>` (write-protected, set to
    /// `invalid`).
    pub fn create_config_param<V, E>(
        &mut self,
        base_name: &str,
        invalid: E,
        internal: bool,
    ) -> Result<ConfigParam<V, E>, ParamError>
    where
        V: ConfigValue,
        E: ConfigValue + From<V>,
    {
        let desired_name = format!("DESIRED_{}", base_name);
        let effective_name = format!("EFFECTIVE_{}", base_name);
        let desired = if internal {
            self.create_protected(&desired_name, V::KIND)?
        } else {
            self.create(&desired_name, V::KIND)?
        };
        let effective = self.create_protected(&effective_name, E::KIND)?;
        self.set_value(effective, invalid.into_value());

        let slot = self.config.slots.len();
        self.config.slots.push(ConfigSlot {
            base_name: base_name.to_string(),
            desired,
            effective,
            internal,
            irrelevant: true,
            snapshot: V::default().into_value(),
            invalid: invalid.into_value(),
        });

        Ok(ConfigParam {
            slot,
            desired,
            effective,
            _marker: PhantomData,
        })
    }

    /// Number of registered configuration parameters.
    pub fn config_param_count(&self) -> usize {
        self.config.slots.len()
    }

    pub fn snapshot_phase(&self) -> SnapshotPhase {
        self.config.phase
    }

    /// Copy every desired value into its snapshot and open the window for the
    /// settings check. An undefined desired value snapshots as zero.
    pub fn begin_settings_check(&mut self) {
        for index in 0..self.config.slots.len() {
            let desired_id = self.config.slots[index].desired;
            let kind = self.kind(desired_id);
            let value = self.value(desired_id).cloned().unwrap_or(match kind {
                ParamKind::Float => ParamValue::Float(0.0),
                _ => ParamValue::Int(0),
            });
            let slot = &mut self.config.slots[index];
            slot.snapshot = value;
            slot.irrelevant = false;
        }
        self.config.phase = SnapshotPhase::Checking;
    }

    /// Settings were accepted: snapshots may no longer be adjusted.
    pub fn freeze_snapshots(&mut self) {
        assert_eq!(
            self.config.phase,
            SnapshotPhase::Checking,
            "snapshots can only be frozen after a settings check began"
        );
        self.config.phase = SnapshotPhase::Frozen;
    }

    pub fn close_snapshot_window(&mut self) {
        self.config.phase = SnapshotPhase::Closed;
    }

    /// Mirror every snapshot into its effective parameter, or the invalid
    /// value for parameters marked irrelevant.
    pub fn publish_effective_values(&mut self) {
        for index in 0..self.config.slots.len() {
            let slot = &self.config.slots[index];
            let value = if slot.irrelevant {
                slot.invalid.clone()
            } else {
                slot.snapshot_as_effective()
            };
            let effective = slot.effective;
            self.set_value(effective, value);
        }
    }

    /// Reset every effective parameter to its invalid value.
    pub fn invalidate_effective_values(&mut self) {
        for index in 0..self.config.slots.len() {
            let slot = &self.config.slots[index];
            let (effective, invalid) = (slot.effective, slot.invalid.clone());
            self.set_value(effective, invalid);
        }
    }

    /// Base names of all configuration parameters, in registration order.
    pub fn config_param_names(&self) -> impl Iterator<Item = &str> {
        self.config.slots.iter().map(|s| s.base_name.as_str())
    }

    fn config_slot(&self, slot: usize) -> &ConfigSlot {
        &self.config.slots[slot]
    }

    fn config_slot_mut(&mut self, slot: usize) -> &mut ConfigSlot {
        &mut self.config.slots[slot]
    }
}

impl<V, E> ConfigParam<V, E>
where
    V: ConfigValue,
    E: ConfigValue + From<V>,
{
    pub fn desired_id(&self) -> ParamId {
        self.desired
    }

    pub fn effective_id(&self) -> ParamId {
        self.effective
    }

    /// Current desired value; zero if it was never written.
    ///
    /// Drivers normally read the snapshot instead. The live value is only
    /// useful for deriving internal parameters from it.
    pub fn desired(&self, table: &ParamTable) -> V {
        table
            .value(self.desired)
            .and_then(V::from_value)
            .unwrap_or_default()
    }

    /// Set the desired value of an internal parameter.
    ///
    /// # Panics
    ///
    /// Panics if the parameter was not created as internal.
    pub fn set_desired(&self, table: &mut ParamTable, value: V) {
        let slot = table.config_slot(self.slot);
        assert!(
            slot.internal,
            "set_desired on non-internal parameter '{}'",
            slot.base_name
        );
        table.set_value(self.desired, value.into_value());
    }

    /// Current effective value, as published.
    pub fn effective(&self, table: &ParamTable) -> Option<E> {
        table.value(self.effective).and_then(E::from_value)
    }

    /// Snapshot taken at the start of the current arm cycle.
    ///
    /// # Panics
    ///
    /// Panics outside the snapshot window.
    pub fn snapshot(&self, table: &ParamTable) -> V {
        let slot = table.config_slot(self.slot);
        assert_ne!(
            table.snapshot_phase(),
            SnapshotPhase::Closed,
            "snapshot of '{}' read outside the snapshot window",
            slot.base_name
        );
        V::from_value(&slot.snapshot).unwrap_or_default()
    }

    pub fn is_irrelevant(&self, table: &ParamTable) -> bool {
        table.config_slot(self.slot).irrelevant
    }

    /// Report this parameter as irrelevant for the current configuration; its
    /// effective value will be the invalid value.
    ///
    /// # Panics
    ///
    /// Panics unless called during the settings check.
    pub fn set_irrelevant(&self, table: &mut ParamTable) {
        Self::assert_checking(table, self.slot);
        table.config_slot_mut(self.slot).irrelevant = true;
    }

    /// Adjust the snapshot for the current configuration.
    ///
    /// # Panics
    ///
    /// Panics unless called during the settings check.
    pub fn set_snapshot(&self, table: &mut ParamTable, value: V) {
        Self::assert_checking(table, self.slot);
        table.config_slot_mut(self.slot).snapshot = value.into_value();
    }

    fn assert_checking(table: &ParamTable, slot: usize) {
        assert_eq!(
            table.snapshot_phase(),
            SnapshotPhase::Checking,
            "'{}' can only be adjusted during the settings check",
            table.config_slot(slot).base_name
        );
    }
}
