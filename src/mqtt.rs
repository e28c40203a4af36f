use anyhow::{bail, Context, Result};
use rumqttc::{Client, MqttOptions, QoS};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(default = "MqttConfig::default_keep_alive_secs")]
    keep_alive_secs: u64,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "pacebms".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("pacebms-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_secs() -> u64 {
        30
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    fn qos(&self) -> Result<QoS> {
        Ok(match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => bail!("Invalid MQTT QoS value {other}, must be 0, 1 or 2"),
        })
    }
}

pub struct MqttPublisher {
    client: Client,
    qos: QoS,
    topic: String,
}

impl MqttPublisher {
    /// Connects to the broker and spawns a thread that keeps the rumqttc
    /// event loop turning; reconnects are handled inside that loop.
    pub fn new(config: MqttConfig) -> Result<Self> {
        let qos = config.qos()?;
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        log::info!(
            "Connecting to MQTT broker {}:{} with client_id {}",
            config.host,
            config.port,
            config.client_id
        );
        let (client, mut connection) = Client::new(options, 10);
        std::thread::spawn(move || {
            for notification in connection.iter() {
                match notification {
                    Ok(event) => log::trace!("MQTT event: {event:?}"),
                    Err(err) => {
                        log::warn!("MQTT connection error: {err}");
                        std::thread::sleep(Duration::from_secs(1));
                    }
                }
            }
        });

        Ok(Self {
            client,
            qos,
            topic: config.topic,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn publish(&mut self, topic: &str, payload: &str) -> Result<()> {
        log::debug!("Publishing to MQTT: Topic='{topic}', Payload='{payload}'");
        self.client
            .publish(topic, self.qos, false, payload)
            .with_context(|| format!("Failed to publish message to MQTT topic: {topic}"))?;
        Ok(())
    }
}
