/// Modbus protocol definitions and message handling
///
/// This module is the message layer the transports hand frames to. A
/// transport only knows the unit ID, the function code and where the body
/// starts; turning a body into a typed request or response (and back) is
/// done here, looked up once per frame by function code.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::ByteBuffer;
use crate::error::{ModbusError, ModbusResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus value type (16-bit register value)
pub type ModbusValue = u16;

/// Modbus unit identifier
pub type UnitId = u8;

/// Reference type carried by every file record sub-request
pub const FILE_REFERENCE_TYPE: u8 = 6;

/// Coil ON value for write single coil
pub const COIL_ON: u16 = 0xFF00;

/// Coil OFF value for write single coil
pub const COIL_OFF: u16 = 0x0000;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Read File Record (0x14)
    ReadFileRecord = 0x14,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            0x14 => Ok(ModbusFunction::ReadFileRecord),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::ReadHoldingRegisters
                | ModbusFunction::ReadInputRegisters
                | ModbusFunction::ReadFileRecord
        )
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::WriteSingleCoil
                | ModbusFunction::WriteSingleRegister
                | ModbusFunction::WriteMultipleCoils
                | ModbusFunction::WriteMultipleRegisters
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
            ModbusFunction::ReadFileRecord => "Read File Record",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Short name
    pub fn name(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "Illegal Function",
            ModbusException::IllegalDataAddress => "Illegal Data Address",
            ModbusException::IllegalDataValue => "Illegal Data Value",
            ModbusException::ServerDeviceFailure => "Slave Device Failure",
            ModbusException::Acknowledge => "Acknowledge",
            ModbusException::ServerDeviceBusy => "Slave Device Busy",
            ModbusException::MemoryParityError => "Memory Parity Error",
            ModbusException::GatewayPathUnavailable => "Gateway Path Unavailable",
            ModbusException::GatewayTargetDeviceFailedToRespond => {
                "Gateway Target Device Failed to Respond"
            }
        }
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "The function code received in the query is not an allowable action for the server",
            ModbusException::IllegalDataAddress => "The data address received in the query is not an allowable address for the server",
            ModbusException::IllegalDataValue => "A value contained in the query data field is not an allowable value for server",
            ModbusException::ServerDeviceFailure => "An unrecoverable error occurred while the server was attempting to perform the requested action",
            ModbusException::Acknowledge => "The server has accepted the request and is processing it, but a long duration of time will be required to do so",
            ModbusException::ServerDeviceBusy => "The server is engaged in processing a long-duration program command",
            ModbusException::MemoryParityError => "The server attempted to read record file, but detected a parity error in the memory",
            ModbusException::GatewayPathUnavailable => "Gateway was unable to allocate an internal communication path",
            ModbusException::GatewayTargetDeviceFailedToRespond => "No response was obtained from the target device",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Direction of a frame, needed to pick a body layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
}

/// How the body of a frame is delimited when no length prefix is available
///
/// Headless TCP and both serial encodings carry no byte count in front of
/// the PDU, so the reader derives the body length from the function code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLayout {
    /// Body is always exactly this many bytes
    Fixed(usize),
    /// Read `prefix` bytes; the last one is a byte count of what follows
    Counted { prefix: usize },
    /// Function code without a known layout
    Unknown,
}

impl BodyLayout {
    pub fn of(kind: FrameKind, function_code: u8) -> Self {
        match kind {
            FrameKind::Request => Self::for_request(function_code),
            FrameKind::Response => Self::for_response(function_code),
        }
    }

    pub fn for_request(function_code: u8) -> Self {
        match ModbusFunction::from_u8(function_code) {
            Ok(ModbusFunction::ReadFileRecord) => BodyLayout::Counted { prefix: 1 },
            Ok(ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters) => {
                BodyLayout::Counted { prefix: 5 }
            }
            Ok(_) => BodyLayout::Fixed(4),
            Err(_) => BodyLayout::Unknown,
        }
    }

    pub fn for_response(function_code: u8) -> Self {
        if function_code & 0x80 != 0 {
            return BodyLayout::Fixed(1);
        }
        match ModbusFunction::from_u8(function_code) {
            // Every read answers with a byte count
            Ok(function) if function.is_read_function() => BodyLayout::Counted { prefix: 1 },
            Ok(_) => BodyLayout::Fixed(4),
            Err(_) => BodyLayout::Unknown,
        }
    }
}

/// Addressing fields shared by every message
///
/// `transaction_id` and `protocol_id` only travel on the wire for TCP/UDP
/// frames with an MBAP header; `headless` records whether the frame was
/// (or is to be) sent without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: UnitId,
    pub headless: bool,
}

impl MessageHeader {
    pub fn new(unit_id: UnitId) -> Self {
        Self {
            unit_id,
            ..Default::default()
        }
    }
}

/// One sub-request of a Read File Record request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSubRequest {
    pub file_number: u16,
    pub record_number: u16,
    /// Length in registers
    pub record_length: u16,
}

/// Request bodies, one variant per supported function code
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPdu {
    ReadCoils { address: ModbusAddress, quantity: u16 },
    ReadDiscreteInputs { address: ModbusAddress, quantity: u16 },
    ReadHoldingRegisters { address: ModbusAddress, quantity: u16 },
    ReadInputRegisters { address: ModbusAddress, quantity: u16 },
    /// `value` is the raw wire value, `COIL_ON` or `COIL_OFF` when valid
    WriteSingleCoil { address: ModbusAddress, value: u16 },
    WriteSingleRegister { address: ModbusAddress, value: ModbusValue },
    WriteMultipleCoils { address: ModbusAddress, quantity: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: ModbusAddress, quantity: u16, values: Vec<u16> },
    ReadFileRecord { requests: Vec<FileSubRequest> },
    /// Function code outside the catalogue, body kept verbatim
    Unsupported { function_code: u8, data: Vec<u8> },
    /// Catalogue function code whose body failed to decode
    Malformed { function_code: u8, reason: String },
}

impl RequestPdu {
    pub fn function_code(&self) -> u8 {
        match self {
            RequestPdu::ReadCoils { .. } => ModbusFunction::ReadCoils.to_u8(),
            RequestPdu::ReadDiscreteInputs { .. } => ModbusFunction::ReadDiscreteInputs.to_u8(),
            RequestPdu::ReadHoldingRegisters { .. } => ModbusFunction::ReadHoldingRegisters.to_u8(),
            RequestPdu::ReadInputRegisters { .. } => ModbusFunction::ReadInputRegisters.to_u8(),
            RequestPdu::WriteSingleCoil { .. } => ModbusFunction::WriteSingleCoil.to_u8(),
            RequestPdu::WriteSingleRegister { .. } => ModbusFunction::WriteSingleRegister.to_u8(),
            RequestPdu::WriteMultipleCoils { .. } => ModbusFunction::WriteMultipleCoils.to_u8(),
            RequestPdu::WriteMultipleRegisters { .. } => ModbusFunction::WriteMultipleRegisters.to_u8(),
            RequestPdu::ReadFileRecord { .. } => ModbusFunction::ReadFileRecord.to_u8(),
            RequestPdu::Unsupported { function_code, .. } => *function_code,
            RequestPdu::Malformed { function_code, .. } => *function_code,
        }
    }

    /// Catalogue entry of this request, `None` outside the catalogue
    pub fn function(&self) -> Option<ModbusFunction> {
        ModbusFunction::from_u8(self.function_code()).ok()
    }

    /// Decode the body of a request from the unread part of `buf`
    pub fn decode(function_code: u8, buf: &mut ByteBuffer) -> ModbusResult<Self> {
        let function = match ModbusFunction::from_u8(function_code) {
            Ok(function) => function,
            Err(_) => {
                let len = buf.remaining();
                return Ok(RequestPdu::Unsupported {
                    function_code,
                    data: buf.read_bytes(len)?.to_vec(),
                });
            }
        };

        let pdu = match function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters => {
                let address = buf.read_u16()?;
                let quantity = buf.read_u16()?;
                match function {
                    ModbusFunction::ReadCoils => RequestPdu::ReadCoils { address, quantity },
                    ModbusFunction::ReadDiscreteInputs => RequestPdu::ReadDiscreteInputs { address, quantity },
                    ModbusFunction::ReadHoldingRegisters => RequestPdu::ReadHoldingRegisters { address, quantity },
                    _ => RequestPdu::ReadInputRegisters { address, quantity },
                }
            }
            ModbusFunction::WriteSingleCoil => RequestPdu::WriteSingleCoil {
                address: buf.read_u16()?,
                value: buf.read_u16()?,
            },
            ModbusFunction::WriteSingleRegister => RequestPdu::WriteSingleRegister {
                address: buf.read_u16()?,
                value: buf.read_u16()?,
            },
            ModbusFunction::WriteMultipleCoils => {
                let address = buf.read_u16()?;
                let quantity = buf.read_u16()?;
                let byte_count = buf.read_u8()? as usize;
                let bytes = buf.read_bytes(byte_count)?;
                let bit_count = (quantity as usize).min(byte_count * 8);
                RequestPdu::WriteMultipleCoils {
                    address,
                    quantity,
                    values: data_utils::unpack_bits(bytes, bit_count),
                }
            }
            ModbusFunction::WriteMultipleRegisters => {
                let address = buf.read_u16()?;
                let quantity = buf.read_u16()?;
                let byte_count = buf.read_u8()? as usize;
                let bytes = buf.read_bytes(byte_count)?;
                RequestPdu::WriteMultipleRegisters {
                    address,
                    quantity,
                    values: data_utils::bytes_to_registers(bytes),
                }
            }
            ModbusFunction::ReadFileRecord => {
                let byte_count = buf.read_u8()? as usize;
                if byte_count % 7 != 0 {
                    return Err(ModbusError::invalid_data(format!(
                        "File record request byte count {} is not a multiple of 7",
                        byte_count
                    )));
                }
                let mut requests = Vec::with_capacity(byte_count / 7);
                for _ in 0..byte_count / 7 {
                    let reference_type = buf.read_u8()?;
                    if reference_type != FILE_REFERENCE_TYPE {
                        return Err(ModbusError::invalid_data(format!(
                            "Invalid file reference type: {}",
                            reference_type
                        )));
                    }
                    requests.push(FileSubRequest {
                        file_number: buf.read_u16()?,
                        record_number: buf.read_u16()?,
                        record_length: buf.read_u16()?,
                    });
                }
                RequestPdu::ReadFileRecord { requests }
            }
        };
        Ok(pdu)
    }

    /// Encode the body of this request (everything after the function code)
    pub fn encode(&self, buf: &mut ByteBuffer) -> ModbusResult<()> {
        match self {
            RequestPdu::ReadCoils { address, quantity }
            | RequestPdu::ReadDiscreteInputs { address, quantity }
            | RequestPdu::ReadHoldingRegisters { address, quantity }
            | RequestPdu::ReadInputRegisters { address, quantity } => {
                buf.write_u16(*address)?;
                buf.write_u16(*quantity)?;
            }
            RequestPdu::WriteSingleCoil { address, value }
            | RequestPdu::WriteSingleRegister { address, value } => {
                buf.write_u16(*address)?;
                buf.write_u16(*value)?;
            }
            RequestPdu::WriteMultipleCoils { address, quantity, values } => {
                let packed = data_utils::pack_bits(values);
                buf.write_u16(*address)?;
                buf.write_u16(*quantity)?;
                buf.write_u8(packed.len() as u8)?;
                buf.write_bytes(&packed)?;
            }
            RequestPdu::WriteMultipleRegisters { address, quantity, values } => {
                buf.write_u16(*address)?;
                buf.write_u16(*quantity)?;
                buf.write_u8((values.len() * 2) as u8)?;
                for value in values {
                    buf.write_u16(*value)?;
                }
            }
            RequestPdu::ReadFileRecord { requests } => {
                buf.write_u8((requests.len() * 7) as u8)?;
                for request in requests {
                    buf.write_u8(FILE_REFERENCE_TYPE)?;
                    buf.write_u16(request.file_number)?;
                    buf.write_u16(request.record_number)?;
                    buf.write_u16(request.record_length)?;
                }
            }
            RequestPdu::Unsupported { data, .. } => buf.write_bytes(data)?,
            RequestPdu::Malformed { function_code, .. } => {
                return Err(ModbusError::invalid_function(*function_code));
            }
        }
        Ok(())
    }

    /// Check quantities and values against the protocol limits
    pub fn validate(&self) -> ModbusResult<()> {
        match self {
            RequestPdu::ReadCoils { address, quantity }
            | RequestPdu::ReadDiscreteInputs { address, quantity } => {
                validate_quantity(*address, *quantity, crate::MAX_COILS_PER_REQUEST)
            }
            RequestPdu::ReadHoldingRegisters { address, quantity }
            | RequestPdu::ReadInputRegisters { address, quantity } => {
                validate_quantity(*address, *quantity, crate::MAX_REGISTERS_PER_REQUEST)
            }
            RequestPdu::WriteSingleCoil { value, .. } => {
                if *value != COIL_ON && *value != COIL_OFF {
                    return Err(ModbusError::invalid_data(format!(
                        "Invalid coil value: 0x{:04X}",
                        value
                    )));
                }
                Ok(())
            }
            RequestPdu::WriteSingleRegister { .. } => Ok(()),
            RequestPdu::WriteMultipleCoils { address, quantity, values } => {
                validate_quantity(*address, *quantity, crate::MAX_COILS_PER_WRITE)?;
                if values.len() != *quantity as usize {
                    return Err(ModbusError::invalid_data(format!(
                        "Coil count {} does not match quantity {}",
                        values.len(),
                        quantity
                    )));
                }
                Ok(())
            }
            RequestPdu::WriteMultipleRegisters { address, quantity, values } => {
                validate_quantity(*address, *quantity, crate::MAX_REGISTERS_PER_WRITE)?;
                if values.len() != *quantity as usize {
                    return Err(ModbusError::invalid_data(format!(
                        "Register count {} does not match quantity {}",
                        values.len(),
                        quantity
                    )));
                }
                Ok(())
            }
            RequestPdu::ReadFileRecord { requests } => {
                if requests.is_empty() {
                    return Err(ModbusError::invalid_data("Empty file record request"));
                }
                // Response must fit: 1 byte length + (2 + 2 * len) per sub-response
                let response_len: usize = requests
                    .iter()
                    .map(|r| 2 + 2 * r.record_length as usize)
                    .sum();
                if response_len > 0xF5 {
                    return Err(ModbusError::invalid_data(format!(
                        "File record response of {} bytes is too large",
                        response_len
                    )));
                }
                Ok(())
            }
            RequestPdu::Unsupported { function_code, .. } => {
                Err(ModbusError::invalid_function(*function_code))
            }
            RequestPdu::Malformed { reason, .. } => Err(ModbusError::invalid_data(reason.clone())),
        }
    }
}

fn validate_quantity(address: u16, quantity: u16, max: u16) -> ModbusResult<()> {
    if quantity == 0 || quantity > max {
        return Err(ModbusError::invalid_data(format!(
            "Invalid quantity: {} (must be 1-{})",
            quantity, max
        )));
    }
    if address as u32 + quantity as u32 > 0x1_0000 {
        return Err(ModbusError::illegal_data_address(address, quantity));
    }
    Ok(())
}

/// Response bodies, one variant per supported function code
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePdu {
    /// Bits as packed on the wire; a decoded response carries whole bytes
    ReadCoils(Vec<bool>),
    ReadDiscreteInputs(Vec<bool>),
    ReadHoldingRegisters(Vec<u16>),
    ReadInputRegisters(Vec<u16>),
    WriteSingleCoil { address: ModbusAddress, value: u16 },
    WriteSingleRegister { address: ModbusAddress, value: ModbusValue },
    WriteMultipleCoils { address: ModbusAddress, quantity: u16 },
    WriteMultipleRegisters { address: ModbusAddress, quantity: u16 },
    /// Register contents of each requested record, in request order
    ReadFileRecord(Vec<Vec<u16>>),
    Exception { function: u8, code: u8 },
}

impl ResponsePdu {
    pub fn function_code(&self) -> u8 {
        match self {
            ResponsePdu::ReadCoils(_) => 0x01,
            ResponsePdu::ReadDiscreteInputs(_) => 0x02,
            ResponsePdu::ReadHoldingRegisters(_) => 0x03,
            ResponsePdu::ReadInputRegisters(_) => 0x04,
            ResponsePdu::WriteSingleCoil { .. } => 0x05,
            ResponsePdu::WriteSingleRegister { .. } => 0x06,
            ResponsePdu::WriteMultipleCoils { .. } => 0x0F,
            ResponsePdu::WriteMultipleRegisters { .. } => 0x10,
            ResponsePdu::ReadFileRecord(_) => 0x14,
            ResponsePdu::Exception { function, .. } => function | 0x80,
        }
    }

    /// Decode the body of a response from the unread part of `buf`
    pub fn decode(function_code: u8, buf: &mut ByteBuffer) -> ModbusResult<Self> {
        if function_code & 0x80 != 0 {
            return Ok(ResponsePdu::Exception {
                function: function_code & 0x7F,
                code: buf.read_u8()?,
            });
        }

        let pdu = match ModbusFunction::from_u8(function_code)? {
            function @ (ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs) => {
                let byte_count = buf.read_u8()? as usize;
                let bytes = buf.read_bytes(byte_count)?;
                let bits = data_utils::unpack_bits(bytes, byte_count * 8);
                if function == ModbusFunction::ReadCoils {
                    ResponsePdu::ReadCoils(bits)
                } else {
                    ResponsePdu::ReadDiscreteInputs(bits)
                }
            }
            function @ (ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters) => {
                let byte_count = buf.read_u8()? as usize;
                if byte_count % 2 != 0 {
                    return Err(ModbusError::frame("Invalid register data length"));
                }
                let registers = data_utils::bytes_to_registers(buf.read_bytes(byte_count)?);
                if function == ModbusFunction::ReadHoldingRegisters {
                    ResponsePdu::ReadHoldingRegisters(registers)
                } else {
                    ResponsePdu::ReadInputRegisters(registers)
                }
            }
            ModbusFunction::WriteSingleCoil => ResponsePdu::WriteSingleCoil {
                address: buf.read_u16()?,
                value: buf.read_u16()?,
            },
            ModbusFunction::WriteSingleRegister => ResponsePdu::WriteSingleRegister {
                address: buf.read_u16()?,
                value: buf.read_u16()?,
            },
            ModbusFunction::WriteMultipleCoils => ResponsePdu::WriteMultipleCoils {
                address: buf.read_u16()?,
                quantity: buf.read_u16()?,
            },
            ModbusFunction::WriteMultipleRegisters => ResponsePdu::WriteMultipleRegisters {
                address: buf.read_u16()?,
                quantity: buf.read_u16()?,
            },
            ModbusFunction::ReadFileRecord => {
                let data_length = buf.read_u8()? as usize;
                let mut consumed = 0;
                let mut records = Vec::new();
                while consumed < data_length {
                    let sub_length = buf.read_u8()? as usize;
                    if sub_length == 0 || (sub_length - 1) % 2 != 0 {
                        return Err(ModbusError::frame(format!(
                            "Invalid file record sub-response length: {}",
                            sub_length
                        )));
                    }
                    let _reference_type = buf.read_u8()?;
                    let registers = data_utils::bytes_to_registers(buf.read_bytes(sub_length - 1)?);
                    records.push(registers);
                    consumed += 1 + sub_length;
                }
                ResponsePdu::ReadFileRecord(records)
            }
        };
        Ok(pdu)
    }

    /// Encode the body of this response (everything after the function code)
    pub fn encode(&self, buf: &mut ByteBuffer) -> ModbusResult<()> {
        match self {
            ResponsePdu::ReadCoils(bits) | ResponsePdu::ReadDiscreteInputs(bits) => {
                let packed = data_utils::pack_bits(bits);
                buf.write_u8(packed.len() as u8)?;
                buf.write_bytes(&packed)?;
            }
            ResponsePdu::ReadHoldingRegisters(registers)
            | ResponsePdu::ReadInputRegisters(registers) => {
                buf.write_u8((registers.len() * 2) as u8)?;
                for register in registers {
                    buf.write_u16(*register)?;
                }
            }
            ResponsePdu::WriteSingleCoil { address, value }
            | ResponsePdu::WriteSingleRegister { address, value } => {
                buf.write_u16(*address)?;
                buf.write_u16(*value)?;
            }
            ResponsePdu::WriteMultipleCoils { address, quantity }
            | ResponsePdu::WriteMultipleRegisters { address, quantity } => {
                buf.write_u16(*address)?;
                buf.write_u16(*quantity)?;
            }
            ResponsePdu::ReadFileRecord(records) => {
                let data_length: usize = records.iter().map(|r| 2 + r.len() * 2).sum();
                buf.write_u8(data_length as u8)?;
                for record in records {
                    buf.write_u8((1 + record.len() * 2) as u8)?;
                    buf.write_u8(FILE_REFERENCE_TYPE)?;
                    for register in record {
                        buf.write_u16(*register)?;
                    }
                }
            }
            ResponsePdu::Exception { code, .. } => buf.write_u8(*code)?,
        }
        Ok(())
    }
}

/// Anything a transport can put on the wire
///
/// The transport writes the header fields it needs for its framing, then
/// the unit ID and function code, then lets the message encode its body.
pub trait ModbusMessage: Send + Sync {
    fn header(&self) -> &MessageHeader;

    fn function_code(&self) -> u8;

    fn encode_body(&self, buf: &mut ByteBuffer) -> ModbusResult<()>;

    fn unit_id(&self) -> UnitId {
        self.header().unit_id
    }

    fn transaction_id(&self) -> u16 {
        self.header().transaction_id
    }
}

/// Modbus request structure
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub header: MessageHeader,
    pub pdu: RequestPdu,
}

impl ModbusRequest {
    pub fn new(unit_id: UnitId, pdu: RequestPdu) -> Self {
        Self {
            header: MessageHeader::new(unit_id),
            pdu,
        }
    }

    /// Build a request from a delimited frame
    ///
    /// The whole frame has already been consumed from the channel, so a
    /// body that fails to decode becomes a `Malformed` request the slave
    /// can answer with an exception instead of dropping the connection.
    pub fn from_frame(header: MessageHeader, function_code: u8, buf: &mut ByteBuffer) -> Self {
        let pdu = match RequestPdu::decode(function_code, buf) {
            Ok(pdu) => pdu,
            Err(e) => RequestPdu::Malformed {
                function_code,
                reason: e.to_string(),
            },
        };
        Self { header, pdu }
    }

    pub fn read_coils(unit_id: UnitId, address: ModbusAddress, quantity: u16) -> Self {
        Self::new(unit_id, RequestPdu::ReadCoils { address, quantity })
    }

    pub fn read_discrete_inputs(unit_id: UnitId, address: ModbusAddress, quantity: u16) -> Self {
        Self::new(unit_id, RequestPdu::ReadDiscreteInputs { address, quantity })
    }

    pub fn read_holding_registers(unit_id: UnitId, address: ModbusAddress, quantity: u16) -> Self {
        Self::new(unit_id, RequestPdu::ReadHoldingRegisters { address, quantity })
    }

    pub fn read_input_registers(unit_id: UnitId, address: ModbusAddress, quantity: u16) -> Self {
        Self::new(unit_id, RequestPdu::ReadInputRegisters { address, quantity })
    }

    pub fn write_single_coil(unit_id: UnitId, address: ModbusAddress, value: bool) -> Self {
        let value = if value { COIL_ON } else { COIL_OFF };
        Self::new(unit_id, RequestPdu::WriteSingleCoil { address, value })
    }

    pub fn write_single_register(unit_id: UnitId, address: ModbusAddress, value: ModbusValue) -> Self {
        Self::new(unit_id, RequestPdu::WriteSingleRegister { address, value })
    }

    pub fn write_multiple_coils(unit_id: UnitId, address: ModbusAddress, values: &[bool]) -> Self {
        Self::new(
            unit_id,
            RequestPdu::WriteMultipleCoils {
                address,
                quantity: values.len() as u16,
                values: values.to_vec(),
            },
        )
    }

    pub fn write_multiple_registers(unit_id: UnitId, address: ModbusAddress, values: &[u16]) -> Self {
        Self::new(
            unit_id,
            RequestPdu::WriteMultipleRegisters {
                address,
                quantity: values.len() as u16,
                values: values.to_vec(),
            },
        )
    }

    pub fn read_file_record(unit_id: UnitId, requests: Vec<FileSubRequest>) -> Self {
        Self::new(unit_id, RequestPdu::ReadFileRecord { requests })
    }

    pub fn set_transaction_id(&mut self, transaction_id: u16) {
        self.header.transaction_id = transaction_id;
    }

    pub fn set_headless(&mut self, headless: bool) {
        self.header.headless = headless;
    }

    /// Validate the request
    pub fn validate(&self) -> ModbusResult<()> {
        self.pdu.validate()
    }

    /// Response carrying this request's addressing
    pub fn create_response(&self, pdu: ResponsePdu) -> ModbusResponse {
        ModbusResponse {
            header: self.header,
            pdu,
        }
    }

    /// Exception response for this request
    pub fn create_exception_response(&self, exception: ModbusException) -> ModbusResponse {
        self.create_response(ResponsePdu::Exception {
            function: self.pdu.function_code() & 0x7F,
            code: exception.to_u8(),
        })
    }
}

impl ModbusMessage for ModbusRequest {
    fn header(&self) -> &MessageHeader {
        &self.header
    }

    fn function_code(&self) -> u8 {
        self.pdu.function_code()
    }

    fn encode_body(&self, buf: &mut ByteBuffer) -> ModbusResult<()> {
        self.pdu.encode(buf)
    }
}

/// Modbus response structure
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub header: MessageHeader,
    pub pdu: ResponsePdu,
}

impl ModbusResponse {
    pub fn new(unit_id: UnitId, pdu: ResponsePdu) -> Self {
        Self {
            header: MessageHeader::new(unit_id),
            pdu,
        }
    }

    /// Build a response from a delimited frame
    pub fn from_frame(
        header: MessageHeader,
        function_code: u8,
        buf: &mut ByteBuffer,
    ) -> ModbusResult<Self> {
        Ok(Self {
            header,
            pdu: ResponsePdu::decode(function_code, buf)?,
        })
    }

    /// Check if this is an exception response
    pub fn is_exception(&self) -> bool {
        matches!(self.pdu, ResponsePdu::Exception { .. })
    }

    /// Get exception error if present
    pub fn exception(&self) -> Option<ModbusError> {
        match self.pdu {
            ResponsePdu::Exception { function, code } => Some(ModbusError::exception(function, code)),
            _ => None,
        }
    }

    /// Turn an exception response into an error
    pub fn into_result(self) -> ModbusResult<Self> {
        match self.exception() {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }

    /// Register values of a read holding/input registers response
    pub fn registers(&self) -> ModbusResult<&[u16]> {
        match &self.pdu {
            ResponsePdu::ReadHoldingRegisters(registers)
            | ResponsePdu::ReadInputRegisters(registers) => Ok(registers),
            ResponsePdu::Exception { function, code } => Err(ModbusError::exception(*function, *code)),
            other => Err(ModbusError::protocol(format!(
                "Response 0x{:02X} carries no registers",
                other.function_code()
            ))),
        }
    }

    /// Bit values of a read coils/discrete inputs response (LSB first, whole bytes)
    pub fn bits(&self) -> ModbusResult<&[bool]> {
        match &self.pdu {
            ResponsePdu::ReadCoils(bits) | ResponsePdu::ReadDiscreteInputs(bits) => Ok(bits),
            ResponsePdu::Exception { function, code } => Err(ModbusError::exception(*function, *code)),
            other => Err(ModbusError::protocol(format!(
                "Response 0x{:02X} carries no bits",
                other.function_code()
            ))),
        }
    }

    /// Record contents of a read file record response
    pub fn file_records(&self) -> ModbusResult<&[Vec<u16>]> {
        match &self.pdu {
            ResponsePdu::ReadFileRecord(records) => Ok(records),
            ResponsePdu::Exception { function, code } => Err(ModbusError::exception(*function, *code)),
            other => Err(ModbusError::protocol(format!(
                "Response 0x{:02X} carries no file records",
                other.function_code()
            ))),
        }
    }
}

impl ModbusMessage for ModbusResponse {
    fn header(&self) -> &MessageHeader {
        &self.header
    }

    fn function_code(&self) -> u8 {
        self.pdu.function_code()
    }

    fn encode_body(&self, buf: &mut ByteBuffer) -> ModbusResult<()> {
        self.pdu.encode(buf)
    }
}

/// Data conversion utilities
pub mod data_utils {
    /// Convert bytes to register values (big-endian), ignoring a trailing odd byte
    pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect()
    }

    /// Pack boolean values into bytes (LSB first)
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let byte_count = (bits.len() + 7) / 8;
        let mut bytes = vec![0u8; byte_count];

        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }

        bytes
    }

    /// Unpack bytes into boolean values
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| bytes.get(i / 8).map_or(false, |byte| byte & (1 << (i % 8)) != 0))
            .collect()
    }
}
