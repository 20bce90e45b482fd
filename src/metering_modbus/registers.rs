use crate::models::MeterFamily;

/* Eastron SDM input registers, IEEE-754 floats spread over two words */
pub const SDM_PHASE_1_VOLTAGE: u16 = 0x0000;
pub const SDM_PHASE_2_VOLTAGE: u16 = 0x0002;
pub const SDM_PHASE_3_VOLTAGE: u16 = 0x0004;
pub const SDM_PHASE_1_CURRENT: u16 = 0x0006;
pub const SDM_PHASE_2_CURRENT: u16 = 0x0008;
pub const SDM_PHASE_3_CURRENT: u16 = 0x000A;
pub const SDM_PHASE_1_POWER: u16 = 0x000C;
pub const SDM_PHASE_2_POWER: u16 = 0x000E;
pub const SDM_PHASE_3_POWER: u16 = 0x0010;
pub const SDM_PHASE_1_APPARENT_POWER: u16 = 0x0012;
pub const SDM_PHASE_2_APPARENT_POWER: u16 = 0x0014;
pub const SDM_PHASE_3_APPARENT_POWER: u16 = 0x0016;
pub const SDM_PHASE_1_REACTIVE_POWER: u16 = 0x0018;
pub const SDM_PHASE_2_REACTIVE_POWER: u16 = 0x001A;
pub const SDM_PHASE_3_REACTIVE_POWER: u16 = 0x001C;
pub const SDM_AVERAGE_L_TO_N_VOLTS: u16 = 0x002A;
pub const SDM_AVERAGE_LINE_CURRENT: u16 = 0x002E;
pub const SDM_TOTAL_SYSTEM_POWER: u16 = 0x0034;
pub const SDM_TOTAL_SYSTEM_REACTIVE_POWER: u16 = 0x003C;
pub const SDM_FREQUENCY: u16 = 0x0046;
pub const SDM_IMPORT_ACTIVE_ENERGY: u16 = 0x0048;
pub const SDM_EXPORT_ACTIVE_ENERGY: u16 = 0x004A;

/* Finder 7M, scaled integers */
pub const FINDER_FIRMWARE_VERSION: u16 = 0x0002;
pub const FINDER_PHASE_1_VOLTAGE: u16 = 0x0064;
pub const FINDER_PHASE_1_CURRENT: u16 = 0x0065;
pub const FINDER_PHASE_1_POWER: u16 = 0x0066;
pub const FINDER_PHASE_1_REACTIVE_POWER: u16 = 0x0067;
pub const FINDER_IMPORT_ACTIVE_ENERGY: u16 = 0x006E;
pub const FINDER_EXPORT_ACTIVE_ENERGY: u16 = 0x0070;

pub const DDM_PHASE_1_VOLTAGE: u16 = 0x0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    Holding,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterFormat {
    Float32,
    Uint16,
    Uint32,
}

/// What a register holds, phase measurements carry the zero based phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measurement {
    Voltage(usize),
    Current(usize),
    Power(usize),
    ApparentPower(usize),
    ReactivePower(usize),
    AverageVoltage,
    AverageCurrent,
    TotalPower,
    TotalReactivePower,
    Frequency,
    EnergyImported,
    EnergyExported,
    FirmwareVersion,
}

impl Measurement {
    pub fn phase(&self) -> Option<usize> {
        match self {
            Measurement::Voltage(p)
            | Measurement::Current(p)
            | Measurement::Power(p)
            | Measurement::ApparentPower(p)
            | Measurement::ReactivePower(p) => Some(*p),
            _ => None,
        }
    }

    /// System wide value a phase 1 reading stands in for on meters without totals
    pub fn aggregate(&self) -> Option<Measurement> {
        match self {
            Measurement::Voltage(0) => Some(Measurement::AverageVoltage),
            Measurement::Current(0) => Some(Measurement::AverageCurrent),
            Measurement::Power(0) => Some(Measurement::TotalPower),
            Measurement::ReactivePower(0) => Some(Measurement::TotalReactivePower),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterDef {
    pub measurement: Measurement,
    pub kind: RegisterKind,
    pub register: u16,
    pub words: u16,
    pub format: RegisterFormat,
    /// Applied by the meter after decoding
    pub scaler: f32,
}

const fn sdm(measurement: Measurement, register: u16) -> RegisterDef {
    RegisterDef {
        measurement,
        kind: RegisterKind::Input,
        register,
        words: 2,
        format: RegisterFormat::Float32,
        scaler: 1.0,
    }
}

const fn finder(measurement: Measurement, register: u16, format: RegisterFormat, scaler: f32) -> RegisterDef {
    let words = match format {
        RegisterFormat::Uint32 | RegisterFormat::Float32 => 2,
        RegisterFormat::Uint16 => 1,
    };
    RegisterDef {
        measurement,
        kind: RegisterKind::Input,
        register,
        words,
        format,
        scaler,
    }
}

/// Everything needed to talk to one family: the probe register, how many
/// phases are polled and the registers of one polling cycle in send order
#[derive(Debug)]
pub struct FamilyDescriptor {
    pub probe: RegisterDef,
    pub phases: usize,
    pub registers: &'static [RegisterDef],
    /// false means the family can be probed but is not polled yet
    pub supported: bool,
}

impl FamilyDescriptor {
    /// Registers of one polling cycle, phases beyond `self.phases` are skipped
    pub fn batch(&self) -> impl Iterator<Item = &'static RegisterDef> {
        let phases = self.phases;
        self.registers
            .iter()
            .filter(move |r| r.measurement.phase().map_or(true, |p| p < phases))
    }

    /// Lookup by register address, used when a response comes back
    pub fn find(&self, register: u16) -> Option<&RegisterDef> {
        if self.probe.register == register {
            return Some(&self.probe);
        }
        self.batch().find(|r| r.register == register)
    }

    pub fn polls(&self, measurement: Measurement) -> bool {
        self.batch().any(|r| r.measurement == measurement)
    }
}

static SDM_REGISTERS: [RegisterDef; 22] = [
    sdm(Measurement::Voltage(0), SDM_PHASE_1_VOLTAGE),
    sdm(Measurement::Voltage(1), SDM_PHASE_2_VOLTAGE),
    sdm(Measurement::Voltage(2), SDM_PHASE_3_VOLTAGE),
    sdm(Measurement::Current(0), SDM_PHASE_1_CURRENT),
    sdm(Measurement::Current(1), SDM_PHASE_2_CURRENT),
    sdm(Measurement::Current(2), SDM_PHASE_3_CURRENT),
    sdm(Measurement::Power(0), SDM_PHASE_1_POWER),
    sdm(Measurement::Power(1), SDM_PHASE_2_POWER),
    sdm(Measurement::Power(2), SDM_PHASE_3_POWER),
    sdm(Measurement::ApparentPower(0), SDM_PHASE_1_APPARENT_POWER),
    sdm(Measurement::ApparentPower(1), SDM_PHASE_2_APPARENT_POWER),
    sdm(Measurement::ApparentPower(2), SDM_PHASE_3_APPARENT_POWER),
    sdm(Measurement::ReactivePower(0), SDM_PHASE_1_REACTIVE_POWER),
    sdm(Measurement::ReactivePower(1), SDM_PHASE_2_REACTIVE_POWER),
    sdm(Measurement::ReactivePower(2), SDM_PHASE_3_REACTIVE_POWER),
    sdm(Measurement::AverageVoltage, SDM_AVERAGE_L_TO_N_VOLTS),
    sdm(Measurement::AverageCurrent, SDM_AVERAGE_LINE_CURRENT),
    sdm(Measurement::TotalPower, SDM_TOTAL_SYSTEM_POWER),
    sdm(Measurement::TotalReactivePower, SDM_TOTAL_SYSTEM_REACTIVE_POWER),
    sdm(Measurement::Frequency, SDM_FREQUENCY),
    sdm(Measurement::EnergyImported, SDM_IMPORT_ACTIVE_ENERGY),
    sdm(Measurement::EnergyExported, SDM_EXPORT_ACTIVE_ENERGY),
];

static FINDER_REGISTERS: [RegisterDef; 6] = [
    finder(Measurement::Voltage(0), FINDER_PHASE_1_VOLTAGE, RegisterFormat::Uint16, 1.0),
    finder(Measurement::Current(0), FINDER_PHASE_1_CURRENT, RegisterFormat::Uint16, 0.1),
    finder(Measurement::Power(0), FINDER_PHASE_1_POWER, RegisterFormat::Uint16, 0.01),
    finder(Measurement::ReactivePower(0), FINDER_PHASE_1_REACTIVE_POWER, RegisterFormat::Uint16, 0.01),
    finder(Measurement::EnergyImported, FINDER_IMPORT_ACTIVE_ENERGY, RegisterFormat::Uint32, 0.01),
    finder(Measurement::EnergyExported, FINDER_EXPORT_ACTIVE_ENERGY, RegisterFormat::Uint32, 0.01),
];

static SDM_THREE_PHASE: FamilyDescriptor = FamilyDescriptor {
    probe: sdm(Measurement::Voltage(0), SDM_PHASE_1_VOLTAGE),
    phases: 3,
    registers: &SDM_REGISTERS,
    supported: true,
};

static SDM_SINGLE_PHASE: FamilyDescriptor = FamilyDescriptor {
    probe: sdm(Measurement::Voltage(0), SDM_PHASE_1_VOLTAGE),
    phases: 1,
    registers: &SDM_REGISTERS,
    supported: true,
};

static FINDER_DESCRIPTOR: FamilyDescriptor = FamilyDescriptor {
    probe: RegisterDef {
        measurement: Measurement::FirmwareVersion,
        kind: RegisterKind::Holding,
        register: FINDER_FIRMWARE_VERSION,
        words: 1,
        format: RegisterFormat::Uint16,
        scaler: 1.0,
    },
    phases: 1,
    registers: &FINDER_REGISTERS,
    supported: true,
};

static DDM_DESCRIPTOR: FamilyDescriptor = FamilyDescriptor {
    probe: sdm(Measurement::Voltage(0), DDM_PHASE_1_VOLTAGE),
    phases: 1,
    registers: &[],
    supported: false,
};

pub fn descriptor(family: MeterFamily) -> &'static FamilyDescriptor {
    match family {
        MeterFamily::SDM630 => &SDM_THREE_PHASE,
        MeterFamily::SDM230
        | MeterFamily::SDM220
        | MeterFamily::SDM120
        | MeterFamily::SDM72D
        | MeterFamily::UNKNOWN => &SDM_SINGLE_PHASE,
        MeterFamily::DDM => &DDM_DESCRIPTOR,
        MeterFamily::FINDER => &FINDER_DESCRIPTOR,
    }
}

/// Register of a measurement for a family, None if the family does not poll it
pub fn register_for(family: MeterFamily, measurement: Measurement) -> Option<&'static RegisterDef> {
    let desc = descriptor(family);
    if desc.probe.measurement == measurement {
        return Some(&desc.probe);
    }
    desc.batch().find(|r| r.measurement == measurement)
}
