//! Line-oriented command surface.
//!
//! Commands arrive over the TCP command socket as `;`-separated ASCII, are
//! parsed on the control thread, and either mutate the parameter registry
//! or fire an orchestrator action. Responses are `Return: ...` on get
//! success and `Error: ...` on any failure; successful sets and executes
//! are silent.
//!
//! Resolution order for `set`/`get`: filename items, channel items, port
//! items, globals, then the hard-coded pseudo parameters (run mode, XPU
//! selection, TCP data endpoints). Everything is case-insensitive.

use crate::api::ControllerKind;
use crate::controller::Controller;
use crate::state::{GetOutcome, SetOutcome};

pub struct CommandParser<'a> {
    controller: &'a mut Controller,
}

/// Split one command into (verb, remainder); the remainder keeps its
/// internal spacing so notes and filenames survive intact.
fn split_verb(command: &str) -> Option<(&str, &str)> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.split_once(char::is_whitespace) {
        Some((verb, rest)) => Some((verb, rest.trim())),
        None => Some((trimmed, "")),
    }
}

impl<'a> CommandParser<'a> {
    pub fn new(controller: &'a mut Controller) -> CommandParser<'a> {
        CommandParser { controller }
    }

    /// Parse a buffer of `;`-separated commands; returns one response line
    /// per command that produced output.
    pub fn execute_buffer(&mut self, buffer: &str) -> Vec<String> {
        let mut responses = Vec::new();
        for command in buffer.split(';') {
            if let Some(response) = self.execute_command(command) {
                responses.push(response);
            }
        }
        responses
    }

    fn execute_command(&mut self, command: &str) -> Option<String> {
        let (verb, rest) = split_verb(command)?;
        log::debug!("command: {} {}", verb, rest);
        match verb.to_ascii_lowercase().as_str() {
            "set" => {
                let (param, value) = match split_verb(rest) {
                    Some((param, value)) if !value.is_empty() => (param, value),
                    _ => return Some("Error: Set command requires a parameter and a value".into()),
                };
                self.set_command(param, value)
            }
            "get" => {
                if rest.is_empty() {
                    return Some("Error: Get command requires a parameter".into());
                }
                Some(self.get_command(rest))
            }
            "execute" => {
                if rest.is_empty() {
                    return Some("Error: Execute command requires an action".into());
                }
                let (action, parameter) = split_verb(rest).unwrap();
                self.execute_action(action, parameter)
            }
            "livenotes" => match self.controller.live_note(rest) {
                Ok(()) => None,
                Err(message) => Some(format!("Error: {}", message)),
            },
            _ => Some("Error: Unrecognized command".into()),
        }
    }

    // ---- set ----

    fn set_command(&mut self, parameter: &str, value: &str) -> Option<String> {
        let state = self.controller.state();
        let outcome = state.write().set_path(parameter, value);
        match outcome {
            SetOutcome::Applied { .. } => None,
            SetOutcome::Invalid { name, valid } => {
                Some(format!("Error: Invalid value for {}. Valid values: {}", name, valid))
            }
            SetOutcome::Restricted(message) => Some(format!("Error: {}", message)),
            SetOutcome::Unknown => self.set_pseudo(parameter, value),
        }
    }

    fn set_pseudo(&mut self, parameter: &str, value: &str) -> Option<String> {
        let running = self.controller.is_running();
        match parameter.to_ascii_lowercase().as_str() {
            "runmode" => match self.controller.set_run_mode(value) {
                Ok(()) => None,
                Err(message) => Some(format!("Error: {}", message)),
            },
            "usedxpuindex" => match self.controller.set_used_xpu_index(value) {
                Ok(()) => None,
                Err(message) => Some(format!("Error: {}", message)),
            },
            "availablexpulist" => Some(
                "Error: Available GPUs cannot be changed through this command: This only \
                 reports the currently connected and available hardware"
                    .into(),
            ),
            "tcpwaveformdataoutputhost" => {
                if running {
                    return Some(
                        "Error: TCPWaveformDataOutputHost cannot be set while controller is \
                         running."
                            .into(),
                    );
                }
                self.controller.wave_endpoint().set_host(value);
                None
            }
            "tcpspikedataoutputhost" => {
                if running {
                    return Some(
                        "Error: TCPSpikeDataOutputHost cannot be set while controller is running."
                            .into(),
                    );
                }
                self.controller.spike_endpoint().set_host(value);
                None
            }
            "tcpwaveformdataoutputport" => {
                if running {
                    return Some(
                        "Error: TCPWaveformDataOutputPort cannot be set while controller is \
                         running."
                            .into(),
                    );
                }
                match value.parse::<u16>() {
                    Ok(port) if port <= 9999 => {
                        self.controller.wave_endpoint().set_port(port);
                        None
                    }
                    _ => Some("Error: Invalid value for TCPWaveformDataOutputPort command".into()),
                }
            }
            "tcpspikedataoutputport" => {
                if running {
                    return Some(
                        "Error: TCPSpikeDataOutputPort cannot be set while controller is running."
                            .into(),
                    );
                }
                match value.parse::<u16>() {
                    Ok(port) if port <= 9999 => {
                        self.controller.spike_endpoint().set_port(port);
                        None
                    }
                    _ => Some("Error: Invalid value for TCPSpikeDataOutputPort command".into()),
                }
            }
            "tcpwaveformdataoutputconnectionstatus" => Some(
                "Error: Connection status cannot be changed through this command. Execute \
                 ConnectTCPWaveformDataOutput or DisconnectTCPWaveformDataOutput"
                    .into(),
            ),
            "tcpspikedataoutputconnectionstatus" => Some(
                "Error: Connection status cannot be changed through this command. Execute \
                 ConnectTCPSpikeDataOutput or DisconnectTCPSpikeDataOutput"
                    .into(),
            ),
            _ => Some("Error: Unrecognized parameter".into()),
        }
    }

    // ---- get ----

    fn get_command(&mut self, parameter: &str) -> String {
        let state = self.controller.state();
        let outcome = state.read().get_path(parameter);
        match outcome {
            GetOutcome::Found { name, value } => format!("Return: {} {}", name, value),
            GetOutcome::Empty { name } => format!("Return: Empty {}", name),
            GetOutcome::Unknown => self.get_pseudo(parameter),
        }
    }

    fn get_pseudo(&mut self, parameter: &str) -> String {
        match parameter.to_ascii_lowercase().as_str() {
            "runmode" => {
                format!("Return: RunMode {}", self.controller.flags().run_mode().label())
            }
            "usedxpuindex" => format!("Return: UsedXPUIndex {}", self.controller.used_xpu_index()),
            "availablexpulist" => {
                format!("Return: AvailableXPUListCommand {}", self.controller.available_xpu_list())
            }
            "tcpwaveformdataoutputhost" => {
                let host = self.controller.wave_endpoint().host();
                if host.is_empty() {
                    "Return: Empty TCPWaveformDataOutputHost".into()
                } else {
                    format!("Return: TCPWaveformDataOutputHost {}", host)
                }
            }
            "tcpspikedataoutputhost" => {
                let host = self.controller.spike_endpoint().host();
                if host.is_empty() {
                    "Return: Empty TCPSpikeDataOutputHost".into()
                } else {
                    format!("Return: TCPSpikeDataOutputHost {}", host)
                }
            }
            "tcpwaveformdataoutputport" => {
                format!("Return: TCPWaveformDataOutputPort {}", self.controller.wave_endpoint().port())
            }
            "tcpspikedataoutputport" => {
                format!("Return: TCPSpikeDataOutputPort {}", self.controller.spike_endpoint().port())
            }
            "tcpwaveformdataoutputconnectionstatus" => format!(
                "Return: TCPWaveformDataOutputConnectionStatus {}",
                self.controller.wave_endpoint().status().label()
            ),
            "tcpspikedataoutputconnectionstatus" => format!(
                "Return: TCPSpikeDataOutputConnectionStatus {}",
                self.controller.spike_endpoint().status().label()
            ),
            _ => "Error: Unrecognized parameter".into(),
        }
    }

    // ---- execute ----

    fn execute_action(&mut self, action: &str, parameter: &str) -> Option<String> {
        let running = self.controller.is_running();
        let stim_controller = self.controller.controller_kind() == ControllerKind::StimRecord;
        let action_lower = action.to_ascii_lowercase();

        let require_stopped = |what: &str| -> Option<String> {
            if running {
                Some(format!("Error: {} cannot be executed while the board is running", what))
            } else {
                None
            }
        };

        match action_lower.as_str() {
            "measureimpedance" => require_stopped("MeasureImpedance").or_else(|| {
                self.controller.measure_impedances().err().map(|e| format!("Error: {}", e))
            }),
            "saveimpedance" => {
                self.controller.save_impedances().err().map(|e| format!("Error: {}", e))
            }
            "rescanports" => require_stopped("RescanPorts").or_else(|| {
                self.controller.rescan_ports().err().map(|e| format!("Error: {}", e))
            }),
            "connecttcpwaveformdataoutput" => {
                self.controller.wave_endpoint().request_connect();
                self.controller.service();
                None
            }
            "connecttcpspikedataoutput" => {
                self.controller.spike_endpoint().request_connect();
                self.controller.service();
                None
            }
            "disconnecttcpwaveformdataoutput" => {
                self.controller.wave_endpoint().request_disconnect();
                self.controller.service();
                None
            }
            "disconnecttcpspikedataoutput" => {
                self.controller.spike_endpoint().request_disconnect();
                self.controller.service();
                None
            }
            "clearalldataoutputs" => {
                self.controller.clear_all_data_outputs();
                None
            }
            "uploadampsettlesettings" if stim_controller => {
                require_stopped("UploadAmpSettleSettings").or_else(|| {
                    self.controller
                        .upload_amp_settle_settings()
                        .err()
                        .map(|e| format!("Error: {}", e))
                })
            }
            "uploadchargerecoverysettings" if stim_controller => {
                require_stopped("UploadChargeRecoverySettings").or_else(|| {
                    self.controller
                        .upload_charge_recovery_settings()
                        .err()
                        .map(|e| format!("Error: {}", e))
                })
            }
            "uploadstimparameters" if stim_controller => {
                require_stopped("UploadStimParameters").or_else(|| {
                    let channel = if parameter.is_empty() { None } else { Some(parameter) };
                    self.controller
                        .upload_stim_parameters(channel)
                        .err()
                        .map(|e| format!("Error: {}", e))
                })
            }
            // upload actions are quietly ignored on non-stim controllers
            "uploadampsettlesettings" | "uploadchargerecoverysettings" | "uploadstimparameters" => {
                None
            }
            "uploadbandwidthsettings" => require_stopped("UploadBandwidthSettings").or_else(|| {
                self.controller.upload_bandwidth_settings().err().map(|e| format!("Error: {}", e))
            }),
            "setspikedetectionthresholds" => {
                require_stopped("SetSpikeDetectionThresholds").or_else(|| {
                    self.controller
                        .set_all_spike_detection_thresholds()
                        .err()
                        .map(|e| format!("Error: {}", e))
                })
            }
            "manualstimtriggeron" => self
                .controller
                .manual_stim_trigger(parameter, true)
                .err()
                .map(|e| format!("Error: {}", e)),
            "manualstimtriggeroff" => self
                .controller
                .manual_stim_trigger(parameter, false)
                .err()
                .map(|e| format!("Error: {}", e)),
            "manualstimtriggerpulse" => self
                .controller
                .manual_stim_trigger_pulse(parameter)
                .err()
                .map(|e| format!("Error: {}", e)),
            _ => Some("Error: Unrecognized action".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::SyntheticBoard;
    use crate::bus::EventBus;
    use crate::controller::Sizing;
    use crate::signal::StreamInfo;
    use crate::sink::MemorySink;
    use crate::xpu::CpuFilter;
    use std::sync::Arc;

    fn controller(kind: ControllerKind) -> Controller {
        let board = SyntheticBoard::new(
            kind,
            vec![StreamInfo { port: 0, num_channels: 32 }],
            30000.0,
        )
        .unpaced(Some(0));
        Controller::new(
            Box::new(board),
            Box::new(CpuFilter::new()),
            Box::new(MemorySink::new()),
            Box::new(MemorySink::new()),
            Arc::new(EventBus::new()),
            Sizing::compact(),
        )
        .unwrap()
    }

    fn run(controller: &mut Controller, buffer: &str) -> Vec<String> {
        CommandParser::new(controller).execute_buffer(buffer)
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut c = controller(ControllerKind::RecordUsb3);
        assert!(run(&mut c, "set tcpnumdatablockswrite 10;").is_empty());
        assert_eq!(
            run(&mut c, "get tcpnumdatablockswrite;"),
            vec!["Return: TCPNumDataBlocksWrite 10"]
        );
    }

    #[test]
    fn unknown_parameter_is_an_error() {
        let mut c = controller(ControllerKind::RecordUsb3);
        assert_eq!(run(&mut c, "get bogus;"), vec!["Error: Unrecognized parameter"]);
        assert_eq!(run(&mut c, "set bogus 1;"), vec!["Error: Unrecognized parameter"]);
        assert_eq!(run(&mut c, "execute bogus;"), vec!["Error: Unrecognized action"]);
    }

    #[test]
    fn restricted_set_while_running() {
        let mut c = controller(ControllerKind::RecordUsb3);
        c.state().write().set_run_flags(true, false, false, false, false);
        let responses = run(&mut c, "set sampleratehertz 20000.0;");
        assert_eq!(responses.len(), 1);
        assert!(responses[0].starts_with("Error:"));
        assert!(responses[0].contains("cannot be set while the board is running"));
        assert_eq!(
            run(&mut c, "get sampleratehertz;"),
            vec!["Return: SampleRateHertz 30000.0"]
        );
    }

    #[test]
    fn record_without_filename_is_rejected() {
        let mut c = controller(ControllerKind::RecordUsb3);
        assert_eq!(
            run(&mut c, "set runmode record;"),
            vec![
                "Error: Filename.BaseFilename and Filename.Path must both be specified before \
                 recording can occur"
            ]
        );
        assert!(!c.is_running());
        assert_eq!(run(&mut c, "get runmode;"), vec!["Return: RunMode Stop"]);
    }

    #[test]
    fn stop_when_not_running_is_an_error() {
        let mut c = controller(ControllerKind::RecordUsb3);
        assert_eq!(
            run(&mut c, "set runmode stop;"),
            vec!["Error: Board must be running in order to stop"]
        );
    }

    #[test]
    fn channel_and_filename_paths() {
        let mut c = controller(ControllerKind::RecordUsb3);
        assert!(run(&mut c, "set a-000.outputtotcp true;").is_empty());
        assert_eq!(
            run(&mut c, "get A-000.outputtotcp;"),
            vec!["Return: A-000.OutputToTcp True"]
        );
        // filename values may contain spaces
        assert!(run(&mut c, "set filename.path /data/session one;").is_empty());
        assert_eq!(
            run(&mut c, "get filename.path;"),
            vec!["Return: Filename.Path /data/session one"]
        );
    }

    #[test]
    fn xpu_pseudo_items() {
        let mut c = controller(ControllerKind::RecordUsb3);
        assert_eq!(run(&mut c, "get usedxpuindex;"), vec!["Return: UsedXPUIndex 0"]);
        let list = run(&mut c, "get availablexpulist;");
        assert!(list[0].starts_with("Return: AvailableXPUListCommand 0:"));
        assert_eq!(
            run(&mut c, "set usedxpuindex 3;"),
            vec!["Error: Invalid value for UsedXPUIndex command"]
        );
        assert!(run(&mut c, "set usedxpuindex 0;").is_empty());
        let readonly = run(&mut c, "set availablexpulist 1;");
        assert!(readonly[0].starts_with("Error: Available GPUs cannot be changed"));
    }

    #[test]
    fn tcp_endpoint_pseudo_items() {
        let mut c = controller(ControllerKind::RecordUsb3);
        assert_eq!(
            run(&mut c, "get tcpwaveformdataoutputhost;"),
            vec!["Return: Empty TCPWaveformDataOutputHost"]
        );
        assert!(run(&mut c, "set tcpwaveformdataoutputhost 127.0.0.1;").is_empty());
        assert_eq!(
            run(&mut c, "get tcpwaveformdataoutputhost;"),
            vec!["Return: TCPWaveformDataOutputHost 127.0.0.1"]
        );
        assert_eq!(
            run(&mut c, "set tcpwaveformdataoutputport 99999;"),
            vec!["Error: Invalid value for TCPWaveformDataOutputPort command"]
        );
        assert!(run(&mut c, "set tcpspikedataoutputport 5002;").is_empty());
        assert_eq!(
            run(&mut c, "get tcpspikedataoutputport;"),
            vec!["Return: TCPSpikeDataOutputPort 5002"]
        );
        assert_eq!(
            run(&mut c, "get tcpwaveformdataoutputconnectionstatus;"),
            vec!["Return: TCPWaveformDataOutputConnectionStatus Disconnected"]
        );
        let status_set = run(&mut c, "set tcpwaveformdataoutputconnectionstatus connected;");
        assert!(status_set[0].starts_with("Error: Connection status cannot be changed"));
    }

    #[test]
    fn livenotes_rejected_unless_recording() {
        let mut c = controller(ControllerKind::RecordUsb3);
        assert_eq!(
            run(&mut c, "livenotes something interesting;"),
            vec!["Error: LiveNotes cannot be added unless the board is recording"]
        );
    }

    #[test]
    fn impedance_actions_require_stopped_board() {
        let mut c = controller(ControllerKind::RecordUsb3);
        c.state().write().set_run_flags(true, false, false, false, false);
        assert_eq!(
            run(&mut c, "execute measureimpedance;"),
            vec!["Error: MeasureImpedance cannot be executed while the board is running"]
        );
        assert_eq!(
            run(&mut c, "execute rescanports;"),
            vec!["Error: RescanPorts cannot be executed while the board is running"]
        );
    }

    #[test]
    fn upload_actions_ignored_on_record_controller() {
        let mut c = controller(ControllerKind::RecordUsb3);
        assert!(run(&mut c, "execute uploadstimparameters;").is_empty());
        assert!(run(&mut c, "execute uploadampsettlesettings;").is_empty());
    }

    #[test]
    fn stim_uploads_work_on_stim_controller() {
        let mut c = controller(ControllerKind::StimRecord);
        assert!(run(&mut c, "execute uploadstimparameters a-000;").is_empty());
        assert!(run(&mut c, "execute uploadbandwidthsettings;").is_empty());
        assert!(run(&mut c, "execute manualstimtriggerpulse f1;").is_empty());
        assert_eq!(
            run(&mut c, "execute manualstimtriggeron f9;").len(),
            1,
            "bad key must error"
        );
    }

    #[test]
    fn multiple_commands_per_buffer() {
        let mut c = controller(ControllerKind::RecordUsb3);
        let responses = run(
            &mut c,
            "set audiovolume 30; get audiovolume; get runmode;",
        );
        assert_eq!(
            responses,
            vec!["Return: AudioVolume 30", "Return: RunMode Stop"]
        );
    }

    #[test]
    fn rescan_clears_stim_undo_history() {
        let mut c = controller(ControllerKind::StimRecord);
        assert!(run(&mut c, "set a-000.firstphaseamplitudemicroamps 120;").is_empty());
        assert_eq!(c.state().read().signals.undo_stack().len(), 1);
        assert!(run(&mut c, "execute rescanports;").is_empty());
        assert!(c.state().read().signals.undo_stack().is_empty());
    }

    #[test]
    fn clear_all_data_outputs_action() {
        let mut c = controller(ControllerKind::RecordUsb3);
        run(&mut c, "set a-000.outputtotcp true; set analog-in-1.outputtotcp true;");
        assert!(c.state().read().signals.any_tcp_output());
        assert!(run(&mut c, "execute clearalldataoutputs;").is_empty());
        assert!(!c.state().read().signals.any_tcp_output());
    }
}
