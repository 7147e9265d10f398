//! Port command: show published port mappings.

use clap::Args;
use cradle::error::{Error, Result};
use cradle::lifecycle::Engine;

#[derive(Args, Debug)]
pub struct PortCmd {
    /// Container to query.
    pub container: String,

    /// Specific container port (`80` or `80/udp`).
    pub port: Option<String>,
}

impl PortCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        let record = engine.resolve(&self.container)?;

        match &self.port {
            None => {
                for mapping in &record.ports {
                    println!("{}", mapping);
                }
            }
            Some(filter) => {
                let (port, proto) = match filter.split_once('/') {
                    Some((p, proto)) => (p, proto),
                    None => (filter.as_str(), "tcp"),
                };
                let port: u16 = port
                    .parse()
                    .map_err(|_| Error::invalid(format!("invalid port {:?}", filter)))?;

                let mut found = false;
                for mapping in &record.ports {
                    if mapping.container_port == port && mapping.protocol.to_string() == proto {
                        println!("{}:{}", mapping.host_ip, mapping.host_port);
                        found = true;
                    }
                }
                if !found {
                    return Err(Error::invalid(format!(
                        "no public port {:?} published for {}",
                        filter,
                        record.short_id()
                    )));
                }
            }
        }
        Ok(())
    }
}
