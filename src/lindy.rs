use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::REFERER;
use tracing::{debug, info};

use crate::power::{PortState, PowerResult, PowerSwitch, PowerSwitchError};

/// Outlets addressed by the switch's `led` bitmap.
pub const OUTLETS: u8 = 24;

/// Lindy IPower switch driven through its `ons.cgi` / `offs.cgi` endpoints.
pub struct LindySwitch {
    client: Client,
    username: String,
    password: String,
}

impl LindySwitch {
    pub fn new(username: &str, password: &str, timeout: Duration) -> Result<Self, PowerSwitchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(classify)?;
        Ok(Self {
            client,
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// 24-character bitmap with a single `1` at the outlet's position.
pub fn outlet_bitmap(port: u8) -> Result<String, PowerSwitchError> {
    if port == 0 || port > OUTLETS {
        return Err(PowerSwitchError::General(format!(
            "outlet {} outside 1..={}",
            port, OUTLETS
        )));
    }
    Ok((1..=OUTLETS)
        .map(|p| if p == port { '1' } else { '0' })
        .collect())
}

pub fn outlet_url(switch_ip: &str, port: u8, state: PortState) -> Result<String, PowerSwitchError> {
    let cgi = match state {
        PortState::On => "ons.cgi",
        PortState::Off => "offs.cgi",
    };
    Ok(format!(
        "http://{}/{}?led={}",
        switch_ip,
        cgi,
        outlet_bitmap(port)?
    ))
}

fn classify(err: reqwest::Error) -> PowerSwitchError {
    if err.is_status() {
        PowerSwitchError::Http(err.to_string())
    } else if err.is_timeout() {
        PowerSwitchError::Timeout(err.to_string())
    } else if err.is_connect() {
        PowerSwitchError::Connection(err.to_string())
    } else {
        PowerSwitchError::General(err.to_string())
    }
}

impl PowerSwitch for LindySwitch {
    fn set_port_state(&self, switch_ip: &str, switch_port: u8, state: PortState) -> PowerResult {
        let url = outlet_url(switch_ip, switch_port, state)?;
        debug!(%url, "lindy request");
        self.client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header(REFERER, format!("http://{}/outlet.htm", switch_ip))
            .send()
            .and_then(|resp| resp.error_for_status())
            .map_err(classify)?;
        Ok(())
    }
}

/// Logs requests instead of switching anything.
pub struct DryRunSwitch;

impl PowerSwitch for DryRunSwitch {
    fn set_port_state(&self, switch_ip: &str, switch_port: u8, state: PortState) -> PowerResult {
        info!(ip = switch_ip, port = switch_port, %state, "dry-run: not switching");
        Ok(())
    }
}
