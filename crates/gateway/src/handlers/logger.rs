//! Handler that writes every payload to the log.

use protocol::DevicePayload;

use super::{Handler, HandlerError};
use crate::devices::Device;

/// Registered name of [`LoggingHandler`].
pub const NAME: &str = "logger";

/// Logs each accepted payload at info level.
#[derive(Debug, Default)]
pub struct LoggingHandler;

impl LoggingHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Handler for LoggingHandler {
    fn name(&self) -> &str {
        NAME
    }

    fn on_device_attached(&self, device: &Device) {
        tracing::info!(
            device_id = %device.id,
            name = %device.display_name(),
            "Logging handler attached"
        );
    }

    fn process_message(
        &self,
        device: &Device,
        payload: &dyn DevicePayload,
    ) -> Result<(), HandlerError> {
        tracing::info!(
            device_id = %device.id,
            name = %device.display_name(),
            type_name = payload.type_name(),
            payload = ?payload,
            "Device message"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceId;
    use protocol::ClimateSensor;

    #[test]
    fn test_logger_accepts_any_payload() {
        let handler = LoggingHandler::new();
        let device = Device::new(DeviceId(0x1f));
        let payload = ClimateSensor {
            temperature: 21.5,
            humidity: 40.0,
            battery_mv: 2900,
        };

        assert_eq!(handler.name(), "logger");
        handler.on_device_attached(&device);
        assert!(handler.process_message(&device, &payload).is_ok());
    }
}
