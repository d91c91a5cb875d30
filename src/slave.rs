/// Slave-side request dispatch
///
/// A `ModbusSlave` maps unit IDs to process images and turns one decoded
/// request into the response to send back. Addressing and data errors never
/// escape as errors: they become exception responses, or silence where a
/// serial line requires it.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{ModbusError, ModbusResult};
use crate::process_image::ProcessImage;
use crate::protocol::{ModbusException, ModbusRequest, ModbusResponse, RequestPdu, ResponsePdu, UnitId, COIL_ON};
use crate::transport::TransportKind;

/// Unit ID addressing every device on a serial line
pub const BROADCAST_UNIT_ID: UnitId = 0;

/// Collection of process images served under their unit IDs
#[derive(Debug, Default)]
pub struct ModbusSlave {
    images: RwLock<HashMap<UnitId, Arc<ProcessImage>>>,
}

impl ModbusSlave {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a slave serving one image under `unit_id`
    pub fn with_image(unit_id: UnitId, image: ProcessImage) -> Self {
        let slave = Self::new();
        if let Ok(mut images) = slave.images.write() {
            images.insert(unit_id, Arc::new(image));
        }
        slave
    }

    /// Register an image, replacing any image held under the same unit ID
    pub fn add_process_image(&self, unit_id: UnitId, image: ProcessImage) -> ModbusResult<Arc<ProcessImage>> {
        let image = Arc::new(image);
        let mut images = self.images.write().map_err(|_| ModbusError::internal("Failed to lock process images"))?;
        images.insert(unit_id, Arc::clone(&image));
        Ok(image)
    }

    pub fn remove_process_image(&self, unit_id: UnitId) -> ModbusResult<Option<Arc<ProcessImage>>> {
        let mut images = self.images.write().map_err(|_| ModbusError::internal("Failed to lock process images"))?;
        Ok(images.remove(&unit_id))
    }

    pub fn process_image(&self, unit_id: UnitId) -> ModbusResult<Arc<ProcessImage>> {
        let images = self.images.read().map_err(|_| ModbusError::internal("Failed to lock process images"))?;
        images
            .get(&unit_id)
            .cloned()
            .ok_or_else(|| ModbusError::illegal_unit_address(unit_id))
    }

    /// Registered unit IDs in ascending order
    pub fn unit_ids(&self) -> Vec<UnitId> {
        let mut ids: Vec<UnitId> = match self.images.read() {
            Ok(images) => images.keys().copied().collect(),
            Err(_) => Vec::new(),
        };
        ids.sort_unstable();
        ids
    }

    /// Produce the response for one request, or `None` when no reply is due
    ///
    /// Over a serial line an unknown unit stays silent and a broadcast is
    /// executed on every image without a reply.
    pub fn handle_request(&self, request: &ModbusRequest, kind: TransportKind) -> Option<ModbusResponse> {
        let unit_id = request.header.unit_id;

        if kind == TransportKind::Serial && unit_id == BROADCAST_UNIT_ID {
            self.broadcast(&request.pdu);
            return None;
        }

        let image = match self.process_image(unit_id) {
            Ok(image) => image,
            Err(e) if kind == TransportKind::Serial => {
                debug!("Ignoring request for unit {}: {}", unit_id, e);
                return None;
            }
            Err(e) => {
                debug!("Rejecting request for unit {}: {}", unit_id, e);
                let exception = e.exception_code().unwrap_or(ModbusException::ServerDeviceFailure);
                return Some(request.create_exception_response(exception));
            }
        };

        match execute(&image, &request.pdu) {
            Ok(pdu) => Some(request.create_response(pdu)),
            Err(e) => {
                let exception = e.exception_code().unwrap_or(ModbusException::ServerDeviceFailure);
                debug!(
                    "Function 0x{:02X} for unit {} failed: {} -> {}",
                    request.pdu.function_code(),
                    unit_id,
                    e,
                    exception.name()
                );
                Some(request.create_exception_response(exception))
            }
        }
    }

    fn broadcast(&self, pdu: &RequestPdu) {
        let images: Vec<Arc<ProcessImage>> = match self.images.read() {
            Ok(images) => images.values().cloned().collect(),
            Err(_) => {
                warn!("Failed to lock process images for broadcast");
                return;
            }
        };
        let function = match pdu.function() {
            Some(function) if function.is_write_function() => function,
            _ => {
                debug!("Ignoring broadcast of function 0x{:02X}", pdu.function_code());
                return;
            }
        };
        for image in images {
            if let Err(e) = execute(&image, pdu) {
                debug!("Broadcast {} failed: {}", function, e);
            }
        }
    }
}

/// Run one request against an image
fn execute(image: &ProcessImage, pdu: &RequestPdu) -> ModbusResult<ResponsePdu> {
    pdu.validate()?;

    let response = match pdu {
        RequestPdu::ReadCoils { address, quantity } => {
            ResponsePdu::ReadCoils(image.read_coils(*address, *quantity)?)
        }
        RequestPdu::ReadDiscreteInputs { address, quantity } => {
            ResponsePdu::ReadDiscreteInputs(image.read_discrete_inputs(*address, *quantity)?)
        }
        RequestPdu::ReadHoldingRegisters { address, quantity } => {
            ResponsePdu::ReadHoldingRegisters(image.read_holding_registers(*address, *quantity)?)
        }
        RequestPdu::ReadInputRegisters { address, quantity } => {
            ResponsePdu::ReadInputRegisters(image.read_input_registers(*address, *quantity)?)
        }
        RequestPdu::WriteSingleCoil { address, value } => {
            image.write_coil(*address, *value == COIL_ON)?;
            ResponsePdu::WriteSingleCoil { address: *address, value: *value }
        }
        RequestPdu::WriteSingleRegister { address, value } => {
            image.write_holding_register(*address, *value)?;
            ResponsePdu::WriteSingleRegister { address: *address, value: *value }
        }
        RequestPdu::WriteMultipleCoils { address, quantity, values } => {
            image.write_coils(*address, values)?;
            ResponsePdu::WriteMultipleCoils { address: *address, quantity: *quantity }
        }
        RequestPdu::WriteMultipleRegisters { address, quantity, values } => {
            image.write_holding_registers(*address, values)?;
            ResponsePdu::WriteMultipleRegisters { address: *address, quantity: *quantity }
        }
        RequestPdu::ReadFileRecord { requests } => {
            let records = requests
                .iter()
                .map(|r| image.read_file_record(r.file_number, r.record_number, r.record_length))
                .collect::<ModbusResult<Vec<_>>>()?;
            ResponsePdu::ReadFileRecord(records)
        }
        // validate() rejects both
        RequestPdu::Unsupported { function_code, .. } | RequestPdu::Malformed { function_code, .. } => {
            return Err(ModbusError::invalid_function(*function_code));
        }
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_image::{File, ProcessImageLayout};
    use crate::protocol::FileSubRequest;

    fn slave() -> ModbusSlave {
        let image = ProcessImage::new(ProcessImageLayout {
            coils: 8,
            discrete_inputs: 8,
            holding_registers: 4,
            input_registers: 4,
        });
        image.add_file(File::new(1, 4)).unwrap();
        image.set_file_record(1, 0, vec![0xAAAA]).unwrap();
        ModbusSlave::with_image(1, image)
    }

    fn exception_code(response: &ModbusResponse) -> Option<u8> {
        match response.pdu {
            ResponsePdu::Exception { code, .. } => Some(code),
            _ => None,
        }
    }

    #[test]
    fn test_write_then_read_register() {
        let slave = slave();
        let write = ModbusRequest::write_single_register(1, 0, 99);
        let response = slave.handle_request(&write, TransportKind::Tcp).unwrap();
        assert_eq!(response.pdu, ResponsePdu::WriteSingleRegister { address: 0, value: 99 });

        let read = ModbusRequest::read_holding_registers(1, 0, 2);
        let response = slave.handle_request(&read, TransportKind::Tcp).unwrap();
        assert_eq!(response.registers().unwrap(), &[99, 0]);
    }

    #[test]
    fn test_out_of_range_is_exception() {
        let slave = slave();
        let read = ModbusRequest::read_holding_registers(1, 4, 1);
        let response = slave.handle_request(&read, TransportKind::Tcp).unwrap();
        assert_eq!(response.pdu.function_code(), 0x83);
        assert_eq!(exception_code(&response), Some(0x02));
    }

    #[test]
    fn test_invalid_quantity_and_coil_value() {
        let slave = slave();
        let read = ModbusRequest::read_holding_registers(1, 0, 126);
        let response = slave.handle_request(&read, TransportKind::Tcp).unwrap();
        assert_eq!(exception_code(&response), Some(0x03));

        let coil = ModbusRequest::new(1, RequestPdu::WriteSingleCoil { address: 0, value: 0x00FF });
        let response = slave.handle_request(&coil, TransportKind::Tcp).unwrap();
        assert_eq!(exception_code(&response), Some(0x03));
    }

    #[test]
    fn test_unsupported_function() {
        let slave = slave();
        let request = ModbusRequest::new(1, RequestPdu::Unsupported { function_code: 0x2B, data: vec![] });
        let response = slave.handle_request(&request, TransportKind::Udp).unwrap();
        assert_eq!(response.pdu.function_code(), 0xAB);
        assert_eq!(exception_code(&response), Some(0x01));
    }

    #[test]
    fn test_unknown_unit() {
        let slave = slave();
        let read = ModbusRequest::read_coils(7, 0, 1);
        let response = slave.handle_request(&read, TransportKind::Tcp).unwrap();
        assert_eq!(exception_code(&response), Some(0x02));

        assert!(slave.handle_request(&read, TransportKind::Serial).is_none());
    }

    #[test]
    fn test_serial_broadcast_writes_without_reply() {
        let slave = slave();
        let write = ModbusRequest::write_multiple_coils(0, 2, &[true, true]);
        assert!(slave.handle_request(&write, TransportKind::Serial).is_none());

        let image = slave.process_image(1).unwrap();
        assert_eq!(image.read_coils(0, 4).unwrap(), vec![false, false, true, true]);

        // Reads have nobody to answer to
        let read = ModbusRequest::read_coils(0, 0, 4);
        assert!(slave.handle_request(&read, TransportKind::Serial).is_none());
    }

    #[test]
    fn test_file_record_dispatch() {
        let slave = slave();
        let request = ModbusRequest::read_file_record(
            1,
            vec![
                FileSubRequest { file_number: 1, record_number: 0, record_length: 1 },
                FileSubRequest { file_number: 1, record_number: 3, record_length: 2 },
            ],
        );
        let response = slave.handle_request(&request, TransportKind::Tcp).unwrap();
        assert_eq!(response.file_records().unwrap(), &[vec![0xAAAA], vec![0, 0]]);

        let request = ModbusRequest::read_file_record(
            1,
            vec![FileSubRequest { file_number: 2, record_number: 0, record_length: 1 }],
        );
        let response = slave.handle_request(&request, TransportKind::Tcp).unwrap();
        assert_eq!(exception_code(&response), Some(0x02));
    }

    #[test]
    fn test_image_registry() {
        let slave = ModbusSlave::new();
        slave.add_process_image(3, ProcessImage::default()).unwrap();
        slave.add_process_image(1, ProcessImage::default()).unwrap();
        assert_eq!(slave.unit_ids(), vec![1, 3]);
        assert!(slave.remove_process_image(3).unwrap().is_some());
        assert!(slave.process_image(3).is_err());
    }
}
