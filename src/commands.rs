//! Gauge command table
//!
//! Symbolic command names map to the 4-bit command field. Firmware
//! revisions add or renumber commands, so a [`CommandTable`] starts from the
//! defaults below and accepts overrides from config.

use std::collections::BTreeMap;

/// Commands understood by stock gauge firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GaugeCommand {
    CheckBatteryVoltage = 0,
    Reset = 1,
    ZeroNeedle = 2,
    SetGaugeAddress = 3,
    SetWakeDuration = 4,
    SetSleepDuration = 5,
    StartSleepInSeconds = 6,
    SleepForMinutes = 7,
    SetRawStepperValue = 8,
    SetRawValueAwake = 9,
    LedOn = 10,
    Identify = 15,
}

impl GaugeCommand {
    pub const ALL: [GaugeCommand; 12] = [
        GaugeCommand::CheckBatteryVoltage,
        GaugeCommand::Reset,
        GaugeCommand::ZeroNeedle,
        GaugeCommand::SetGaugeAddress,
        GaugeCommand::SetWakeDuration,
        GaugeCommand::SetSleepDuration,
        GaugeCommand::StartSleepInSeconds,
        GaugeCommand::SleepForMinutes,
        GaugeCommand::SetRawStepperValue,
        GaugeCommand::SetRawValueAwake,
        GaugeCommand::LedOn,
        GaugeCommand::Identify,
    ];

    /// Name used in config files and on the command line
    pub fn name(self) -> &'static str {
        match self {
            GaugeCommand::CheckBatteryVoltage => "Check_Battery_Voltage",
            GaugeCommand::Reset => "Reset",
            GaugeCommand::ZeroNeedle => "Zero_Needle",
            GaugeCommand::SetGaugeAddress => "Set_Gauge_Address",
            GaugeCommand::SetWakeDuration => "Set_Wake_duration",
            GaugeCommand::SetSleepDuration => "Set_Sleep_duration",
            GaugeCommand::StartSleepInSeconds => "Start_sleep_in_seconds",
            GaugeCommand::SleepForMinutes => "Sleep_for_minutes",
            GaugeCommand::SetRawStepperValue => "Set_Raw_Stepper_Value",
            GaugeCommand::SetRawValueAwake => "Set_Raw_Value_awake",
            GaugeCommand::LedOn => "Led_on",
            GaugeCommand::Identify => "Identify",
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Name → command number lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTable {
    entries: BTreeMap<String, u8>,
}

impl Default for CommandTable {
    fn default() -> Self {
        let entries = GaugeCommand::ALL
            .iter()
            .map(|cmd| (cmd.name().to_string(), cmd.code()))
            .collect();
        Self { entries }
    }
}

impl CommandTable {
    /// Defaults plus `overrides`; an override with a default's name replaces it
    pub fn with_overrides(overrides: &BTreeMap<String, u8>) -> Self {
        let mut table = Self::default();
        for (name, code) in overrides {
            table.entries.insert(name.clone(), *code);
        }
        table
    }

    /// Command number for `name` (case-insensitive)
    pub fn get(&self, name: &str) -> Option<u8> {
        self.entries.get(name).copied().or_else(|| {
            self.entries
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| *v)
        })
    }

    /// Number for a well-known command, honouring overrides
    pub fn code(&self, command: GaugeCommand) -> u8 {
        self.get(command.name()).unwrap_or(command.code())
    }

    /// Accept a symbolic name or a bare number
    pub fn resolve(&self, name_or_number: &str) -> Option<u8> {
        self.get(name_or_number)
            .or_else(|| name_or_number.trim().parse::<u8>().ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u8)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
