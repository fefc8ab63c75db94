/// In-memory transport used by the client tests
#[cfg(test)]
pub(crate) mod sim {
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, MutexGuard};

    use crate::event::EventSink;
    use crate::state::{Channel, ChannelRole, NodeRecord};
    use crate::transport::{
        Connection, DeviceDescriptor, Destination, Link, LocalIdentity, Transport, TransportKind,
        node_id_string,
    };

    #[derive(Debug, Clone, PartialEq)]
    pub struct SentText {
        pub address: String,
        pub text: String,
        pub destination: Destination,
        pub channel: u32,
        pub want_ack: bool,
    }

    #[derive(Debug, Clone)]
    pub struct SimRadio {
        pub identity: LocalIdentity,
        pub channels: Vec<Channel>,
        pub nodes: Vec<NodeRecord>,
    }

    #[derive(Default)]
    struct SimState {
        radios: HashMap<String, SimRadio>,
        sinks: HashMap<String, EventSink>,
        sent: Vec<SentText>,
        admin: Vec<String>,
        fail_scan: bool,
        fail_send: bool,
        hang_connect: bool,
    }

    #[derive(Clone)]
    pub struct SimTransport {
        kind: TransportKind,
        state: Arc<Mutex<SimState>>,
    }

    impl SimTransport {
        pub fn new(kind: TransportKind) -> Self {
            Self {
                kind,
                state: Arc::new(Mutex::new(SimState::default())),
            }
        }

        fn state(&self) -> MutexGuard<'_, SimState> {
            self.state.lock().expect("sim state poisoned")
        }

        pub fn add_radio(&self, address: &str, radio: SimRadio) {
            self.state().radios.insert(address.to_string(), radio);
        }

        /// Sink handed to the most recent link opened to `address`
        pub fn sink(&self, address: &str) -> EventSink {
            self.state()
                .sinks
                .get(address)
                .cloned()
                .expect("link was never started")
        }

        pub fn sent(&self) -> Vec<SentText> {
            self.state().sent.clone()
        }

        pub fn admin_requests(&self) -> Vec<String> {
            self.state().admin.clone()
        }

        pub fn fail_scans(&self, fail: bool) {
            self.state().fail_scan = fail;
        }

        pub fn fail_sends(&self, fail: bool) {
            self.state().fail_send = fail;
        }

        /// Make `connect` wait forever, like a radio that never answers
        pub fn hang_connects(&self, hang: bool) {
            self.state().hang_connect = hang;
        }
    }

    pub fn remote(short_name: &str, num: u32) -> NodeRecord {
        NodeRecord {
            node_id: Some(node_id_string(num)),
            node_num: Some(num),
            short_name: Some(short_name.to_string()),
            long_name: Some(format!("{short_name} Station")),
            ..Default::default()
        }
    }

    /// A radio with a primary, a named secondary and a disabled channel,
    /// which already knows about remote node `BRAV` (0xb2)
    pub fn radio(short_name: &str, num: u32) -> SimRadio {
        SimRadio {
            identity: LocalIdentity {
                node_id: node_id_string(num),
                node_num: num,
                short_name: short_name.to_string(),
                long_name: format!("{short_name} Station"),
            },
            channels: vec![
                Channel {
                    index: 0,
                    name: String::new(),
                    role: ChannelRole::Primary,
                },
                Channel {
                    index: 1,
                    name: "ops".to_string(),
                    role: ChannelRole::Secondary,
                },
                Channel {
                    index: 2,
                    name: String::new(),
                    role: ChannelRole::Disabled,
                },
            ],
            nodes: vec![remote(short_name, num), remote("BRAV", 0xb2)],
        }
    }

    #[async_trait]
    impl Transport for SimTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn scan(&self) -> Result<Vec<DeviceDescriptor>> {
            let state = self.state();
            if state.fail_scan {
                bail!("adapter unavailable");
            }
            let mut devices: Vec<DeviceDescriptor> = state
                .radios
                .keys()
                .map(|address| DeviceDescriptor {
                    transport: self.kind,
                    address: address.clone(),
                    display_name: address.clone(),
                })
                .collect();
            devices.sort_by(|a, b| a.address.cmp(&b.address));
            Ok(devices)
        }

        async fn connect(&self, address: &str) -> Result<Connection> {
            let (radio, hang) = {
                let state = self.state();
                (state.radios.get(address).cloned(), state.hang_connect)
            };
            if hang {
                std::future::pending::<()>().await;
            }
            let Some(radio) = radio else {
                bail!("no radio answering at {address}");
            };
            Ok(Connection {
                link: Box::new(SimLink {
                    address: address.to_string(),
                    state: self.state.clone(),
                    open: true,
                }),
                identity: radio.identity,
                channels: radio.channels,
                nodes: radio.nodes,
            })
        }
    }

    struct SimLink {
        address: String,
        state: Arc<Mutex<SimState>>,
        open: bool,
    }

    impl SimLink {
        fn state(&self) -> MutexGuard<'_, SimState> {
            self.state.lock().expect("sim state poisoned")
        }
    }

    #[async_trait]
    impl Link for SimLink {
        fn start(&mut self, sink: EventSink) {
            self.state().sinks.insert(self.address.clone(), sink);
        }

        async fn send_text(
            &mut self,
            text: &str,
            destination: &Destination,
            channel: u32,
            want_ack: bool,
        ) -> Result<()> {
            if !self.open {
                bail!("link closed");
            }
            let mut state = self.state();
            if state.fail_send {
                bail!("radio rejected the packet");
            }
            state.sent.push(SentText {
                address: self.address.clone(),
                text: text.to_string(),
                destination: destination.clone(),
                channel,
                want_ack,
            });
            Ok(())
        }

        async fn reset_node_db(&mut self) -> Result<()> {
            self.state().admin.push("nodedb_reset".to_string());
            Ok(())
        }

        async fn reboot(&mut self, delay_secs: i32) -> Result<()> {
            self.state().admin.push(format!("reboot {delay_secs}"));
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.open = false;
            Ok(())
        }
    }
}

#[cfg(test)]
mod state_tests {
    use crate::state::{Channel, ChannelRole, Message, NodeRecord, Position, StateStore};
    use anyhow::{Context, Result};
    use chrono::NaiveDate;

    fn at(hour: u32, min: u32, sec: u32) -> Result<chrono::NaiveDateTime> {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(hour, min, sec))
            .context("valid timestamp")
    }

    fn channels() -> Vec<Channel> {
        vec![
            Channel {
                index: 0,
                name: String::new(),
                role: ChannelRole::Primary,
            },
            Channel {
                index: 1,
                name: "ops".to_string(),
                role: ChannelRole::Secondary,
            },
            Channel {
                index: 2,
                name: "spare".to_string(),
                role: ChannelRole::Disabled,
            },
        ]
    }

    #[test]
    fn test_register_creates_enabled_channel_buffers() -> Result<()> {
        let mut store = StateStore::new();
        store.register_device("ALFA", &channels());

        let device = store.device("ALFA").context("device registered")?;
        assert!(device.connected);
        assert!(device.channel_messages.contains_key("Channel 0"));
        assert!(device.channel_messages.contains_key("ops"));
        assert!(!device.channel_messages.contains_key("spare"));
        assert_eq!(store.enabled_channels("ALFA").len(), 2);
        Ok(())
    }

    #[test]
    fn test_direct_append_writes_both_views() -> Result<()> {
        let mut store = StateStore::new();
        let message = Message::direct(at(9, 0, 0)?, "BRAV", "ALFA", "BRAV", "ping");

        store.append_direct_message("ALFA", "BRAV", message.clone());

        assert_eq!(store.direct_messages("ALFA"), &[message.clone()]);
        assert_eq!(store.conversation("ALFA", "BRAV"), &[message]);
        assert_eq!(store.conversation_partners("ALFA"), vec!["BRAV".to_string()]);
        Ok(())
    }

    #[test]
    fn test_remove_device_keeps_history() -> Result<()> {
        let mut store = StateStore::new();
        store.register_device("ALFA", &channels());
        store.append_channel_message(
            "ALFA",
            "ops",
            Message::channel(at(9, 0, 0)?, "BRAV", "ops", "still here"),
        );

        store.remove_device("ALFA");

        assert!(!store.is_connected("ALFA"));
        assert_eq!(store.channel_messages("ALFA", "ops").len(), 1);
        Ok(())
    }

    #[test]
    fn test_upsert_node_is_idempotent() -> Result<()> {
        let mut store = StateStore::new();
        let node = NodeRecord {
            node_id: Some("!000000b2".to_string()),
            node_num: Some(0xb2),
            short_name: Some("BRAV".to_string()),
            ..Default::default()
        };

        assert!(store.upsert_node("ALFA", node.clone()));
        let once = store.nodes("ALFA");
        assert!(store.upsert_node("ALFA", node));
        assert_eq!(store.nodes("ALFA"), once);
        assert_eq!(once.len(), 1);
        Ok(())
    }

    #[test]
    fn test_partial_update_keeps_known_fields() -> Result<()> {
        let mut store = StateStore::new();
        store.upsert_node(
            "ALFA",
            NodeRecord {
                node_id: Some("!000000b2".to_string()),
                short_name: Some("BRAV".to_string()),
                long_name: Some("Bravo Base".to_string()),
                ..Default::default()
            },
        );
        store.upsert_node(
            "ALFA",
            NodeRecord {
                node_id: Some("!000000b2".to_string()),
                position: Some(Position {
                    time: None,
                    latitude: 37.7749,
                    longitude: -122.4194,
                    altitude: Some(12),
                }),
                ..Default::default()
            },
        );

        let node = store.node("ALFA", "!000000b2").context("node stored")?;
        assert_eq!(node.short_name.as_deref(), Some("BRAV"));
        assert_eq!(
            node.position.as_ref().map(|p| p.latitude),
            Some(37.7749)
        );
        assert_eq!(store.long_name_for("ALFA", "BRAV"), "Bravo Base");
        Ok(())
    }

    #[test]
    fn test_node_without_id_is_counted_not_stored() -> Result<()> {
        let mut store = StateStore::new();
        let stored = store.upsert_node(
            "ALFA",
            NodeRecord {
                node_num: Some(0xd4),
                short_name: Some("DELT".to_string()),
                ..Default::default()
            },
        );

        assert!(!stored);
        assert!(store.nodes("ALFA").is_empty());
        assert_eq!(store.diagnostics().malformed_node_updates, 1);
        Ok(())
    }

    #[test]
    fn test_long_name_fallback() -> Result<()> {
        let store = StateStore::new();
        assert_eq!(store.long_name_for("ALFA", "ZULU"), "Meshtastic ZULU");
        Ok(())
    }

    #[test]
    fn test_channel_key_resolution() -> Result<()> {
        let mut store = StateStore::new();
        store.register_device("ALFA", &channels());

        assert_eq!(store.channel_key("ALFA", Some(0)), "Channel 0");
        assert_eq!(store.channel_key("ALFA", Some(1)), "ops");
        assert_eq!(store.channel_key("ALFA", Some(5)), "Channel 5");
        assert_eq!(store.channel_key("ALFA", None), "Unknown");
        Ok(())
    }
}

#[cfg(test)]
mod classify_tests {
    use crate::classify::{MISSING_TEXT, MessageKind, Sender, classify, classify_destination};
    use crate::connection::{ConnectionState, NodeTable, Session, SessionInfo};
    use crate::event::Packet;
    use crate::state::NodeRecord;
    use crate::transport::TransportKind;
    use anyhow::Result;

    fn session(nodes: NodeTable) -> Session {
        Session {
            info: SessionInfo {
                display_name: "ALFA".to_string(),
                transport: TransportKind::Tcp,
                address: "10.0.0.1".to_string(),
                state: ConnectionState::Connected,
                node_id: "!000000a1".to_string(),
                node_num: 0xa1,
                long_name: "Alfa Station".to_string(),
            },
            nodes,
        }
    }

    fn text_to(to: &str) -> Packet {
        Packet {
            text: Some("hi".to_string()),
            to_id: Some(to.to_string()),
            from_id: Some("!000000b2".to_string()),
            from_num: Some(0xb2),
            channel_index: Some(0),
            rx_time: Some(1_714_564_800),
        }
    }

    #[test]
    fn test_destination_rules() -> Result<()> {
        assert_eq!(
            classify_destination(Some("!000000a1"), "!000000a1"),
            MessageKind::Direct
        );
        assert_eq!(
            classify_destination(Some("^all"), "!000000a1"),
            MessageKind::Broadcast
        );
        assert_eq!(
            classify_destination(Some("!000000c3"), "!000000a1"),
            MessageKind::PassThrough
        );
        assert_eq!(
            classify_destination(None, "!000000a1"),
            MessageKind::PassThrough
        );
        Ok(())
    }

    #[test]
    fn test_id_lookup_wins_over_number_lookup() -> Result<()> {
        let mut nodes = NodeTable::default();
        nodes.update(&NodeRecord {
            node_id: Some("!000000b2".to_string()),
            short_name: Some("BRAV".to_string()),
            ..Default::default()
        });
        nodes.update(&NodeRecord {
            node_num: Some(0xb2),
            short_name: Some("OTHR".to_string()),
            ..Default::default()
        });

        let classified = classify(&text_to("^all"), &session(nodes));
        assert_eq!(classified.sender, Sender::Named("BRAV".to_string()));
        Ok(())
    }

    #[test]
    fn test_number_lookup_when_id_unknown() -> Result<()> {
        let mut nodes = NodeTable::default();
        nodes.update(&NodeRecord {
            node_num: Some(0xb2),
            short_name: Some("BRAV".to_string()),
            ..Default::default()
        });

        let classified = classify(&text_to("!000000a1"), &session(nodes));
        assert_eq!(classified.kind, MessageKind::Direct);
        assert_eq!(classified.sender.display_name(), "BRAV");
        Ok(())
    }

    #[test]
    fn test_unresolved_and_missing_senders_differ() -> Result<()> {
        let unresolved = classify(&text_to("^all"), &session(NodeTable::default()));
        assert_eq!(unresolved.sender, Sender::Unresolved);
        assert_eq!(unresolved.sender.display_name(), "????");

        let packet = Packet {
            from_id: None,
            from_num: None,
            ..text_to("^all")
        };
        let missing = classify(&packet, &session(NodeTable::default()));
        assert_eq!(missing.sender, Sender::Missing);
        assert_eq!(missing.sender.display_name(), "unknown");
        assert_ne!(
            unresolved.sender.display_name(),
            missing.sender.display_name()
        );
        Ok(())
    }

    #[test]
    fn test_missing_fields_degrade() -> Result<()> {
        let packet = Packet {
            text: None,
            channel_index: None,
            rx_time: None,
            ..text_to("^all")
        };
        let classified = classify(&packet, &session(NodeTable::default()));

        assert_eq!(classified.kind, MessageKind::Broadcast);
        assert_eq!(classified.text, MISSING_TEXT);
        assert_eq!(classified.channel_index, None);
        Ok(())
    }
}

#[cfg(test)]
mod persist_tests {
    use crate::persist::{LogRecord, MessageLog, replay};
    use crate::state::{Channel, ChannelRole, Message, StateStore};
    use anyhow::{Context, Result};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn at(sec: u32) -> Result<chrono::NaiveDateTime> {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(12, 0, sec))
            .context("valid timestamp")
    }

    fn log_in(dir: &TempDir) -> MessageLog {
        MessageLog::new(
            dir.path().join("channel-messages.csv"),
            dir.path().join("direct-messages.csv"),
        )
    }

    #[test]
    fn test_rows_are_fully_quoted_without_header() -> Result<()> {
        let dir = TempDir::new()?;
        let log = log_in(&dir);

        log.append_channel(
            "ALFA",
            "Channel 0",
            &Message::channel(at(0)?, "BRAV", "Channel 0", "hi, \"there\""),
        )?;

        let contents = std::fs::read_to_string(log.channel_path())?;
        assert_eq!(
            contents,
            "\"ALFA\",\"Channel 0\",\"2024-05-01 12:00:00\",\"BRAV\",\"hi, \"\"there\"\"\"\r\n"
        );
        Ok(())
    }

    #[test]
    fn test_replay_rebuilds_buffers() -> Result<()> {
        let dir = TempDir::new()?;
        let log = log_in(&dir);

        let first = Message::channel(at(0)?, "BRAV", "ops", "one");
        let second = Message::channel(at(1)?, "ALFA", "ops", "two");
        let direct = Message::direct(at(2)?, "BRAV", "ALFA", "BRAV", "psst");
        log.append_channel("ALFA", "ops", &first)?;
        log.append_channel("ALFA", "ops", &second)?;
        log.append_direct("ALFA", "BRAV", &direct)?;

        let records = log.load_all()?;
        assert_eq!(records.len(), 3);
        assert!(matches!(records[2], LogRecord::Direct(_)));

        let mut store = StateStore::new();
        assert_eq!(replay(&records, &mut store), 3);
        assert_eq!(store.channel_messages("ALFA", "ops"), &[first, second]);
        assert_eq!(store.direct_messages("ALFA"), &[direct.clone()]);
        assert_eq!(store.conversation("ALFA", "BRAV"), &[direct]);
        Ok(())
    }

    #[test]
    fn test_unnamed_primary_rows_replay_into_channel_zero() -> Result<()> {
        let dir = TempDir::new()?;
        let log = log_in(&dir);
        std::fs::write(
            log.channel_path(),
            "\"ALFA\",\"\",\"2024-05-01 12:00:07\",\"BRAV\",\"from the old client\"\r\n",
        )?;

        let mut store = StateStore::new();
        store.register_device(
            "ALFA",
            &[Channel {
                index: 0,
                name: String::new(),
                role: ChannelRole::Primary,
            }],
        );
        assert_eq!(replay(&log.load_all()?, &mut store), 1);

        let messages = store.channel_messages_by_index("ALFA", 0);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "from the old client");
        assert_eq!(messages[0].key.as_deref(), Some("Channel 0"));
        assert!(store.channel_messages("ALFA", "").is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_files_load_empty() -> Result<()> {
        let dir = TempDir::new()?;
        assert!(log_in(&dir).load_all()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_bad_rows_are_skipped() -> Result<()> {
        let dir = TempDir::new()?;
        let log = log_in(&dir);
        std::fs::write(
            log.channel_path(),
            "\"ALFA\",\"short row\"\r\n\
             \"ALFA\",\"ops\",\"yesterday\",\"BRAV\",\"bad time\"\r\n\
             \"ALFA\",\"ops\",\"2024-05-01 12:00:05\",\"BRAV\",\"good\"\r\n",
        )?;

        let records = log.load_all()?;
        assert_eq!(records.len(), 2);

        let mut store = StateStore::new();
        assert_eq!(replay(&records, &mut store), 1);
        let messages = store.channel_messages("ALFA", "ops");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "good");
        Ok(())
    }
}

#[cfg(test)]
mod config_tests {
    use crate::config::{ClientConfig, parse_flag, validate_tcp_address, with_default_port};
    use anyhow::Result;
    use std::collections::HashMap;
    use std::path::PathBuf;

    #[test]
    fn test_from_lookup() -> Result<()> {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TCP_DEVICES", "192.168.1.20, meshnode.local:4403, 300.1.1.1, bad host"),
            ("CHANNEL_MESSAGE_LOG", "/tmp/chan.csv"),
            ("WANT_ACK_BROADCAST", "Yes"),
        ]);
        let config = ClientConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(
            config.tcp_devices,
            vec!["192.168.1.20".to_string(), "meshnode.local:4403".to_string()]
        );
        assert_eq!(config.channel_log, PathBuf::from("/tmp/chan.csv"));
        assert_eq!(config.direct_log, PathBuf::from("direct-messages.csv"));
        assert!(config.want_ack_broadcast);
        Ok(())
    }

    #[test]
    fn test_flags() -> Result<()> {
        assert!(parse_flag("true"));
        assert!(parse_flag(" YES "));
        assert!(!parse_flag("1"));
        assert!(!parse_flag("no"));
        Ok(())
    }

    #[test]
    fn test_tcp_addresses() -> Result<()> {
        assert!(validate_tcp_address("10.0.0.5").is_ok());
        assert!(validate_tcp_address("10.0.0.5:4403").is_ok());
        assert!(validate_tcp_address("[fe80::1]:4403").is_ok());
        assert!(validate_tcp_address("radio-1.lan").is_ok());
        assert!(validate_tcp_address("10.0.0.256").is_err());
        assert!(validate_tcp_address("radio:port").is_err());

        assert_eq!(with_default_port("10.0.0.5"), "10.0.0.5:4403");
        assert_eq!(with_default_port("10.0.0.5:9000"), "10.0.0.5:9000");
        assert_eq!(with_default_port("radio-1.lan"), "radio-1.lan:4403");
        Ok(())
    }
}

#[cfg(test)]
mod transport_tests {
    use super::sim::{SimTransport, radio};
    use crate::error::MeshError;
    use crate::transport::{
        TransportKind, TransportRegistry, TransportScanner, filter_known, node_id_string,
        parse_device_spec, parse_node_id,
    };
    use anyhow::Result;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_kind_parsing() -> Result<()> {
        assert_eq!(TransportKind::parse("TCP")?, TransportKind::Tcp);
        assert_eq!(TransportKind::parse("ble")?, TransportKind::Ble);
        assert!(matches!(
            TransportKind::parse("carrier-pigeon"),
            Err(MeshError::UnknownTransportType(_))
        ));

        let (kind, address) = parse_device_spec("tcp:10.0.0.1:4403")?;
        assert_eq!(kind, TransportKind::Tcp);
        assert_eq!(address, "10.0.0.1:4403");
        assert!(parse_device_spec("/dev/ttyUSB0").is_err());
        Ok(())
    }

    #[test]
    fn test_node_ids() -> Result<()> {
        assert_eq!(node_id_string(0xFFFF_FFFF), "^all");
        assert_eq!(node_id_string(0xb2), "!000000b2");
        assert_eq!(parse_node_id("!000000b2"), Some(0xb2));
        assert_eq!(parse_node_id("000000b2"), None);
        Ok(())
    }

    #[tokio::test]
    async fn test_scan_isolates_transport_failures() -> Result<()> {
        let tcp = SimTransport::new(TransportKind::Tcp);
        tcp.add_radio("10.0.0.1", radio("ALFA", 0xa1));
        tcp.add_radio("10.0.0.2", radio("CHAR", 0xc3));
        let serial = SimTransport::new(TransportKind::Serial);
        serial.fail_scans(true);

        let mut registry = TransportRegistry::new();
        registry.register(Arc::new(tcp));
        registry.register(Arc::new(serial));
        let scanner = TransportScanner::new(registry);

        let report = scanner
            .scan(&[TransportKind::Serial, TransportKind::Tcp, TransportKind::Ble])
            .await;

        assert_eq!(report.devices.len(), 2);
        assert_eq!(report.failures.len(), 2);
        assert!(matches!(report.failures[0].error, MeshError::Scan { .. }));
        assert!(matches!(
            report.failures[1].error,
            MeshError::TransportNotSupported(TransportKind::Ble)
        ));

        let known = HashSet::from(["10.0.0.1".to_string()]);
        let fresh = filter_known(report.devices, &known);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].address, "10.0.0.2");
        Ok(())
    }

    #[tokio::test]
    async fn test_scan_named_rejects_unknown_type() -> Result<()> {
        let scanner = TransportScanner::new(TransportRegistry::new());
        let result = scanner.scan_named(&["tcp", "smoke-signal"][..]).await;
        assert!(matches!(result, Err(MeshError::UnknownTransportType(_))));
        Ok(())
    }
}

#[cfg(test)]
mod client_tests {
    use super::sim::{SimTransport, radio, remote};
    use crate::config::ClientConfig;
    use crate::connection::ConnectionState;
    use crate::dispatch::{Dispatcher, Notification};
    use crate::error::MeshError;
    use crate::event::Packet;
    use crate::message::{send_channel_text, send_direct_text};
    use crate::persist::LogRecord;
    use crate::state::NodeRecord;
    use crate::transport::{Destination, TransportKind, TransportRegistry};
    use crate::MeshClient;
    use anyhow::{Context, Result};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const ADDRESS: &str = "10.0.0.1";

    fn test_config(dir: &TempDir) -> ClientConfig {
        ClientConfig {
            channel_log: dir.path().join("channel-messages.csv"),
            direct_log: dir.path().join("direct-messages.csv"),
            ..ClientConfig::default()
        }
    }

    fn client_with(sim: &SimTransport, config: ClientConfig) -> (MeshClient, Dispatcher) {
        let mut registry = TransportRegistry::new();
        registry.register(Arc::new(sim.clone()));
        MeshClient::new(config, registry)
    }

    async fn connected(dir: &TempDir) -> Result<(MeshClient, Dispatcher, SimTransport)> {
        let sim = SimTransport::new(TransportKind::Tcp);
        sim.add_radio(ADDRESS, radio("ALFA", 0xa1));
        let (client, mut dispatcher) = client_with(&sim, test_config(dir));

        let info = client.connect(TransportKind::Tcp, ADDRESS).await?;
        assert_eq!(info.display_name, "ALFA");
        assert_eq!(info.state, ConnectionState::Connected);
        dispatcher.drain().await;
        Ok((client, dispatcher, sim))
    }

    fn broadcast(text: &str, channel: Option<u32>) -> Packet {
        Packet {
            text: Some(text.to_string()),
            to_id: Some("^all".to_string()),
            from_id: Some("!000000b2".to_string()),
            from_num: Some(0xb2),
            channel_index: channel,
            rx_time: None,
        }
    }

    fn texts(messages: &[crate::state::Message]) -> Vec<&str> {
        messages.iter().map(|m| m.text.as_str()).collect()
    }

    #[tokio::test]
    async fn test_send_and_receive_on_channel() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, mut dispatcher, sim) = connected(&dir).await?;

        send_channel_text(&client, "ALFA", 0, "hello").await?;
        sim.sink(ADDRESS)
            .on_packet_received(broadcast("world", Some(0)));
        dispatcher.drain().await;

        let store = client.snapshot().await;
        let messages = store.channel_messages_by_index("ALFA", 0);
        assert_eq!(texts(messages), vec!["hello", "world"]);
        assert_eq!(messages[0].from, "ALFA");
        assert_eq!(messages[1].from, "BRAV");

        let sent = sim.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, Destination::Broadcast);
        assert!(!sent[0].want_ack);

        let records = client.log().load_all()?;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| matches!(r, LogRecord::Channel(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_want_ack_broadcast_is_forwarded() -> Result<()> {
        let dir = TempDir::new()?;
        let sim = SimTransport::new(TransportKind::Tcp);
        sim.add_radio(ADDRESS, radio("ALFA", 0xa1));
        let config = ClientConfig {
            want_ack_broadcast: true,
            ..test_config(&dir)
        };
        let (client, mut dispatcher) = client_with(&sim, config);
        client.connect(TransportKind::Tcp, ADDRESS).await?;
        dispatcher.drain().await;

        send_channel_text(&client, "ALFA", 1, "ack me").await?;

        let sent = sim.sent();
        assert!(sent[0].want_ack);
        assert_eq!(sent[0].channel, 1);
        let store = client.snapshot().await;
        assert_eq!(texts(store.channel_messages("ALFA", "ops")), vec!["ack me"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_direct_messages_in_both_directions() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, mut dispatcher, sim) = connected(&dir).await?;

        sim.sink(ADDRESS).on_packet_received(Packet {
            to_id: Some("!000000a1".to_string()),
            ..broadcast("ping", Some(0))
        });
        dispatcher.drain().await;
        send_direct_text(&client, "ALFA", "BRAV", "pong").await?;

        let sent = sim.sent();
        assert_eq!(
            sent[0].destination,
            Destination::Node {
                id: Some("!000000b2".to_string()),
                num: Some(0xb2)
            }
        );

        let store = client.snapshot().await;
        assert_eq!(texts(store.direct_messages("ALFA")), vec!["ping", "pong"]);
        assert_eq!(
            texts(store.conversation("ALFA", "BRAV")),
            vec!["ping", "pong"]
        );
        assert!(store.channel_messages_by_index("ALFA", 0).is_empty());

        let records = client.log().load_all()?;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| matches!(r, LogRecord::Direct(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_pass_through_is_counted_not_stored() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, mut dispatcher, sim) = connected(&dir).await?;
        let mut notifications = client.subscribe();

        sim.sink(ADDRESS).on_packet_received(Packet {
            to_id: Some("!000000c3".to_string()),
            ..broadcast("not for us", Some(0))
        });
        dispatcher.drain().await;

        let store = client.snapshot().await;
        assert!(store.channel_messages_by_index("ALFA", 0).is_empty());
        assert!(store.direct_messages("ALFA").is_empty());
        assert_eq!(store.diagnostics().pass_through_packets, 1);
        assert!(matches!(
            notifications.try_recv()?,
            Notification::PassThrough { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_channel_notification_serializes_for_json_output() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, mut dispatcher, sim) = connected(&dir).await?;
        let mut notifications = client.subscribe();

        sim.sink(ADDRESS)
            .on_packet_received(broadcast("status ok", Some(1)));
        dispatcher.drain().await;

        let notification = notifications.try_recv()?;
        let json = serde_json::to_value(&notification)?;
        let body = json
            .get("ChannelMessage")
            .context("expected a ChannelMessage notification")?;
        assert_eq!(body["device"], "ALFA");
        assert_eq!(body["channel"], "ops");
        assert_eq!(body["message"]["from"], "BRAV");
        assert_eq!(body["message"]["text"], "status ok");
        Ok(())
    }

    #[tokio::test]
    async fn test_broadcast_without_channel_is_filed_as_unknown() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, mut dispatcher, sim) = connected(&dir).await?;

        sim.sink(ADDRESS).on_packet_received(broadcast("where?", None));
        dispatcher.drain().await;

        let store = client.snapshot().await;
        assert!(store.channel_messages_by_index("ALFA", 0).is_empty());
        assert_eq!(texts(store.channel_messages("ALFA", "Unknown")), vec!["where?"]);
        assert_eq!(store.diagnostics().unknown_channel_packets, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_node_update_still_resolves_by_number() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, mut dispatcher, sim) = connected(&dir).await?;
        let sink = sim.sink(ADDRESS);

        sink.on_node_updated(NodeRecord {
            node_num: Some(0xd4),
            short_name: Some("DELT".to_string()),
            ..Default::default()
        });
        sink.on_packet_received(Packet {
            from_id: None,
            from_num: Some(0xd4),
            ..broadcast("from delta", Some(0))
        });
        dispatcher.drain().await;

        let store = client.snapshot().await;
        assert_eq!(store.diagnostics().malformed_node_updates, 1);
        assert_eq!(store.nodes("ALFA").len(), 2);
        let messages = store.channel_messages_by_index("ALFA", 0);
        assert_eq!(messages[0].from, "DELT");
        Ok(())
    }

    #[tokio::test]
    async fn test_node_updates_merge_into_directory() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, mut dispatcher, sim) = connected(&dir).await?;

        sim.sink(ADDRESS).on_node_updated(NodeRecord {
            snr: Some(6.25),
            ..remote("BRAV", 0xb2)
        });
        sim.sink(ADDRESS).on_node_updated(remote("ECHO", 0xe5));
        dispatcher.drain().await;

        let store = client.snapshot().await;
        assert_eq!(store.nodes("ALFA").len(), 3);
        let bravo = store.node("ALFA", "!000000b2").context("bravo known")?;
        assert_eq!(bravo.snr, Some(6.25));
        assert_eq!(bravo.long_name.as_deref(), Some("BRAV Station"));

        client
            .connections()
            .find_node("ALFA", "ECHO")
            .await
            .context("echo resolvable for direct sends")?;
        Ok(())
    }

    #[tokio::test]
    async fn test_send_validation() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, _dispatcher, sim) = connected(&dir).await?;

        assert!(matches!(
            send_channel_text(&client, "ALFA", 0, "   ").await,
            Err(MeshError::EmptyMessage)
        ));
        assert!(matches!(
            send_channel_text(&client, "ALFA", 2, "hi").await,
            Err(MeshError::ChannelDisabled { index: 2, .. })
        ));
        assert!(matches!(
            send_channel_text(&client, "ALFA", 7, "hi").await,
            Err(MeshError::UnknownChannel { index: 7, .. })
        ));
        assert!(matches!(
            send_direct_text(&client, "ALFA", "ZULU", "hi").await,
            Err(MeshError::UnknownNode { .. })
        ));

        assert!(sim.sent().is_empty());
        let store = client.snapshot().await;
        assert!(store.direct_messages("ALFA").is_empty());
        assert!(store.channel_messages_by_index("ALFA", 0).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_send_mirrors_nothing() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, _dispatcher, sim) = connected(&dir).await?;
        sim.fail_sends(true);

        let result = send_channel_text(&client, "ALFA", 0, "lost").await;
        assert!(matches!(result, Err(MeshError::Send { .. })));

        let store = client.snapshot().await;
        assert!(store.channel_messages_by_index("ALFA", 0).is_empty());
        assert!(client.log().load_all()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_connect_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, _dispatcher, _sim) = connected(&dir).await?;

        let result = client.connect(TransportKind::Tcp, ADDRESS).await;
        assert!(matches!(result, Err(MeshError::DuplicateConnect(_))));
        assert_eq!(client.connections().sessions().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_and_unsupported_transports() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, _dispatcher, _sim) = connected(&dir).await?;

        let result = client
            .connections()
            .connect_named("carrier-pigeon", ADDRESS)
            .await;
        let error = result.err().context("unknown transport must fail")?;
        assert!(matches!(error, MeshError::UnknownTransportType(_)));
        assert!(!error.is_recoverable());

        let result = client.connect(TransportKind::Ble, "AA:BB:CC:DD:EE:FF").await;
        assert!(matches!(
            result,
            Err(MeshError::TransportNotSupported(TransportKind::Ble))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_connection_failure_is_typed() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, _dispatcher, _sim) = connected(&dir).await?;

        let result = client.connect(TransportKind::Tcp, "10.0.0.99").await;
        let error = result.err().context("unreachable radio must fail")?;
        assert!(matches!(error, MeshError::Connection { .. }));
        assert!(error.is_recoverable());
        assert!(client.connections().session("10.0.0.99").await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_send_on_closed_session_fails() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, mut dispatcher, _sim) = connected(&dir).await?;

        client.disconnect("ALFA").await?;
        dispatcher.drain().await;

        let result = send_channel_text(&client, "ALFA", 0, "too late").await;
        assert!(matches!(result, Err(MeshError::SessionClosed(_))));
        assert!(!client.snapshot().await.is_connected("ALFA"));
        Ok(())
    }

    #[tokio::test]
    async fn test_reconnect_keeps_history() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, mut dispatcher, sim) = connected(&dir).await?;

        send_channel_text(&client, "ALFA", 0, "before").await?;
        send_direct_text(&client, "ALFA", "BRAV", "kept").await?;
        let old_sink = sim.sink(ADDRESS);
        client.disconnect("ALFA").await?;
        dispatcher.drain().await;

        let info = client.connect(TransportKind::Tcp, ADDRESS).await?;
        assert_eq!(info.display_name, "ALFA");
        dispatcher.drain().await;

        // Reports from the replaced link are ignored
        old_sink.on_connection_lost();
        old_sink.on_packet_received(broadcast("ghost", Some(0)));
        sim.sink(ADDRESS)
            .on_packet_received(broadcast("after", Some(0)));
        dispatcher.drain().await;

        let store = client.snapshot().await;
        assert!(store.is_connected("ALFA"));
        assert_eq!(
            texts(store.channel_messages_by_index("ALFA", 0)),
            vec!["before", "after"]
        );
        assert_eq!(texts(store.direct_messages("ALFA")), vec!["kept"]);
        assert_eq!(texts(store.conversation("ALFA", "BRAV")), vec!["kept"]);
        assert!(client.connections().is_connected("ALFA").await);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_connect_releases_address() -> Result<()> {
        let dir = TempDir::new()?;
        let sim = SimTransport::new(TransportKind::Tcp);
        sim.add_radio(ADDRESS, radio("ALFA", 0xa1));
        let (client, mut dispatcher) = client_with(&sim, test_config(&dir));
        client.connect(TransportKind::Tcp, ADDRESS).await?;
        client.disconnect("ALFA").await?;
        dispatcher.drain().await;

        sim.hang_connects(true);
        let attempt = tokio::time::timeout(
            Duration::from_millis(50),
            client.connect(TransportKind::Tcp, ADDRESS),
        )
        .await;
        assert!(attempt.is_err(), "connect should still be pending");

        let session = client
            .connections()
            .session("ALFA")
            .await
            .context("session kept")?;
        assert_eq!(session.state, ConnectionState::Disconnected);

        sim.hang_connects(false);
        let info = client.connect(TransportKind::Tcp, ADDRESS).await?;
        assert_eq!(info.state, ConnectionState::Connected);
        Ok(())
    }

    #[tokio::test]
    async fn test_renamed_radio_leaves_old_session_disconnected() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, mut dispatcher, sim) = connected(&dir).await?;
        client.disconnect("ALFA").await?;
        dispatcher.drain().await;

        sim.add_radio(ADDRESS, radio("ZULU", 0xa1));
        let info = client.connect(TransportKind::Tcp, ADDRESS).await?;
        assert_eq!(info.display_name, "ZULU");

        let states: Vec<_> = client
            .connections()
            .sessions()
            .await
            .into_iter()
            .map(|session| (session.display_name, session.state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("ALFA".to_string(), ConnectionState::Disconnected),
                ("ZULU".to_string(), ConnectionState::Connected),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_loss_before_reconnect_is_still_announced() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, mut dispatcher, _sim) = connected(&dir).await?;
        let mut notifications = client.subscribe();

        // Reconnect before the dispatcher sees the disconnect
        client.disconnect("ALFA").await?;
        client.connect(TransportKind::Tcp, ADDRESS).await?;
        dispatcher.drain().await;

        let mut seen = Vec::new();
        while let Ok(notification) = notifications.try_recv() {
            match notification {
                Notification::DeviceDisconnected { device } => seen.push(format!("down {device}")),
                Notification::DeviceConnected { device } => seen.push(format!("up {device}")),
                _ => {}
            }
        }
        assert_eq!(seen, vec!["down ALFA", "up ALFA"]);
        assert!(client.snapshot().await.is_connected("ALFA"));
        assert!(client.connections().is_connected("ALFA").await);
        Ok(())
    }

    #[tokio::test]
    async fn test_link_loss_is_announced_once() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, mut dispatcher, sim) = connected(&dir).await?;
        let mut notifications = client.subscribe();

        let sink = sim.sink(ADDRESS);
        sink.on_connection_lost();
        sink.on_connection_lost();
        dispatcher.drain().await;

        let mut disconnects = 0;
        while let Ok(notification) = notifications.try_recv() {
            if matches!(notification, Notification::DeviceDisconnected { .. }) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
        assert!(!client.connections().is_connected("ALFA").await);
        assert!(!client.snapshot().await.is_connected("ALFA"));
        Ok(())
    }

    #[tokio::test]
    async fn test_node_db_reset_forces_disconnect() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, mut dispatcher, sim) = connected(&dir).await?;

        client.connections().reset_node_db("ALFA").await?;
        dispatcher.drain().await;

        assert_eq!(sim.admin_requests(), vec!["nodedb_reset".to_string()]);
        let session = client
            .connections()
            .session("ALFA")
            .await
            .context("session kept")?;
        assert_eq!(session.state, ConnectionState::Disconnected);
        assert!(!client.snapshot().await.is_connected("ALFA"));
        Ok(())
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_block_delivery() -> Result<()> {
        let dir = TempDir::new()?;
        let sim = SimTransport::new(TransportKind::Tcp);
        sim.add_radio(ADDRESS, radio("ALFA", 0xa1));
        let config = ClientConfig {
            channel_log: dir.path().join("missing-dir").join("channel.csv"),
            ..test_config(&dir)
        };
        let (client, mut dispatcher) = client_with(&sim, config);
        client.connect(TransportKind::Tcp, ADDRESS).await?;
        dispatcher.drain().await;

        sim.sink(ADDRESS)
            .on_packet_received(broadcast("still shown", Some(0)));
        dispatcher.drain().await;

        let store = client.snapshot().await;
        assert_eq!(
            texts(store.channel_messages_by_index("ALFA", 0)),
            vec!["still shown"]
        );
        assert_eq!(store.diagnostics().persistence_failures, 1);

        let message = &store.channel_messages_by_index("ALFA", 0)[0];
        let error = client
            .log()
            .append_channel("ALFA", "Channel 0", message)
            .err()
            .context("write into a missing directory must fail")?;
        assert!(error.is_persistence());
        assert!(error.is_recoverable());
        Ok(())
    }

    #[tokio::test]
    async fn test_known_names_filter_scan_results() -> Result<()> {
        let dir = TempDir::new()?;
        let (client, _dispatcher, sim) = connected(&dir).await?;
        sim.add_radio("10.0.0.2", radio("CHAR", 0xc3));

        let known = client.connections().known_names().await;
        assert!(known.contains("ALFA"));
        assert!(known.contains(ADDRESS));

        let report = client.scanner().scan(&[TransportKind::Tcp]).await;
        let fresh = crate::transport::filter_known(report.devices, &known);
        let addresses: Vec<_> = fresh.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(addresses, vec!["10.0.0.2"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_history_survives_restart() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let (client, _dispatcher, _sim) = connected(&dir).await?;
            send_channel_text(&client, "ALFA", 1, "logged").await?;
            send_direct_text(&client, "ALFA", "BRAV", "also logged").await?;
        }

        let sim = SimTransport::new(TransportKind::Tcp);
        let (client, _dispatcher) = client_with(&sim, test_config(&dir));
        assert_eq!(client.load_history().await?, 2);

        let store = client.snapshot().await;
        assert_eq!(texts(store.channel_messages("ALFA", "ops")), vec!["logged"]);
        assert_eq!(
            texts(store.conversation("ALFA", "BRAV")),
            vec!["also logged"]
        );
        assert!(!store.is_connected("ALFA"));
        Ok(())
    }
}
