//! Weather Tool - current conditions from an Open-Meteo compatible forecast API.

use super::{ParamContract, ParamKind, Tool, ToolContext, ToolResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub struct WeatherTool {
    client: reqwest::Client,
    base_url: String,
    contract: ParamContract,
}

impl WeatherTool {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("chatrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        let contract = ParamContract::new()
            .param("latitude", ParamKind::Number, true, Some("Latitude in decimal degrees"))
            .param("longitude", ParamKind::Number, true, Some("Longitude in decimal degrees"));
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            contract,
        })
    }

    fn forecast_url(&self, p: &Params) -> String {
        format!(
            "{}/v1/forecast?latitude={}&longitude={}&current=temperature_2m&hourly=temperature_2m&daily=sunrise,sunset&timezone=auto",
            self.base_url, p.latitude, p.longitude
        )
    }
}

#[derive(Deserialize)]
struct Params {
    latitude: f64,
    longitude: f64,
}

#[async_trait]
impl Tool for WeatherTool {
    fn id(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Get the current weather at a location"
    }

    fn contract(&self) -> &ParamContract {
        &self.contract
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let p: Params = serde_json::from_value(params).context("Invalid params")?;
        let resp = self
            .client
            .get(self.forecast_url(&p))
            .send()
            .await
            .context("Weather service unreachable")?;
        if !resp.status().is_success() {
            return Ok(ToolResult::error(format!(
                "Weather service returned HTTP {}",
                resp.status()
            )));
        }
        let forecast: Value = resp.json().await.context("Invalid weather response")?;

        let summary = match forecast.pointer("/current/temperature_2m") {
            Some(temp) => {
                let unit = forecast
                    .pointer("/current_units/temperature_2m")
                    .and_then(Value::as_str)
                    .unwrap_or("°C");
                format!(
                    "Current temperature at ({}, {}) is {temp}{unit}",
                    p.latitude, p.longitude
                )
            }
            None => format!("Forecast retrieved for ({}, {})", p.latitude, p.longitude),
        };
        Ok(ToolResult::success(summary).with_data(forecast))
    }
}
