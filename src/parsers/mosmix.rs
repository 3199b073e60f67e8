//! MOSMIX forecast parser: a ZIP containing one Latin-1-encoded KML document
//! with a shared forecast time axis and one `Placemark` per station.

use super::{ParseContext, Parser};
use crate::error::PipelineError;
use crate::model::{Location, ObservationType, ParsedRecord, SourceIdentity, WeatherFields};
use crate::units::parse_mosmix_timestamp;
use chrono::{DateTime, Utc};
use encoding_rs::WINDOWS_1252;
use roxmltree::Document;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

pub struct MosmixParser;

const ELEMENT_MAP: &[(&str, Field)] = &[
    ("TTT", Field::Temperature),
    ("DD", Field::WindDirection),
    ("FF", Field::WindSpeed),
    ("RR1c", Field::Precipitation),
    ("SunD1", Field::Sunshine),
    ("PPPP", Field::PressureMsl),
];

#[derive(Copy, Clone)]
enum Field {
    Temperature,
    WindDirection,
    WindSpeed,
    Precipitation,
    Sunshine,
    PressureMsl,
}

impl Parser for MosmixParser {
    fn parse(&self, path: &Path, ctx: &ParseContext) -> Result<Vec<ParsedRecord>, PipelineError> {
        self.parse_inner(path, ctx).map_err(|source| PipelineError::Parse {
            url: ctx.url.clone(),
            source,
        })
    }
}

impl MosmixParser {
    fn parse_inner(&self, path: &Path, ctx: &ParseContext) -> anyhow::Result<Vec<ParsedRecord>> {
        let file = File::open(path)?;
        let mut archive = zip::ZipArchive::new(file)?;

        anyhow::ensure!(archive.len() == 1, "expected exactly one entry in MOSMIX archive");
        let mut entry = archive.by_index(0)?;
        let mut raw = Vec::new();
        entry.read_to_end(&mut raw)?;
        drop(entry);

        let (xml, _, had_errors) = WINDOWS_1252.decode(&raw);
        anyhow::ensure!(!had_errors, "invalid Latin-1 byte sequence in MOSMIX document");

        let doc = Document::parse(&xml)?;
        let root = doc.root_element();

        let timesteps: Vec<DateTime<Utc>> = root
            .descendants()
            .filter(|n| n.has_tag_name("TimeStep"))
            .filter_map(|n| n.text())
            .filter_map(|text| parse_mosmix_timestamp(text).ok())
            .collect();

        let mut records = Vec::new();

        for placemark in root.descendants().filter(|n| n.has_tag_name("Placemark")) {
            let station_code = text_of(&placemark, "name").unwrap_or_default();
            if station_code.is_empty() {
                continue;
            }
            let description = text_of(&placemark, "description");

            let Some(coords_text) = placemark
                .descendants()
                .find(|n| n.has_tag_name("coordinates"))
                .and_then(|n| n.text())
            else {
                continue;
            };

            let mut parts = coords_text.split(',').map(str::trim);
            let (Some(lon), Some(lat), Some(height)) = (
                parts.next().and_then(|v| v.parse::<f64>().ok()),
                parts.next().and_then(|v| v.parse::<f64>().ok()),
                parts.next().and_then(|v| v.parse::<f64>().ok()),
            ) else {
                continue;
            };

            let source = SourceIdentity {
                observation_type: ObservationType::Forecast,
                station_code: station_code.clone(),
                wmo_station_id: None,
                station_name: description,
                location: Location::Known {
                    latitude: lat,
                    longitude: lon,
                    height,
                },
            };

            let mut series: HashMap<&str, Vec<Option<f64>>> = HashMap::new();
            for forecast in placemark.descendants().filter(|n| n.has_tag_name("Forecast")) {
                let Some(element_name) = forecast.attribute("elementName") else {
                    continue;
                };
                let Some(values_text) = forecast
                    .descendants()
                    .find(|n| n.has_tag_name("value"))
                    .and_then(|n| n.text())
                else {
                    continue;
                };
                let values: Vec<Option<f64>> = values_text
                    .split_whitespace()
                    .map(|token| {
                        if token == "-" {
                            None
                        } else {
                            token.parse::<f64>().ok()
                        }
                    })
                    .collect();
                series.insert(element_name, values);
            }

            for (index, &timestamp) in timesteps.iter().enumerate() {
                let mut fields = WeatherFields::default();
                let mut any_field = false;

                for (element_name, field) in ELEMENT_MAP {
                    let Some(values) = series.get(element_name) else {
                        continue;
                    };
                    let Some(Some(value)) = values.get(index) else {
                        continue;
                    };
                    any_field = true;
                    let value = ctx.ignored_values.apply(&ctx.url, timestamp, element_name, Some(*value));
                    match field {
                        Field::Temperature => fields.temperature = value,
                        Field::WindDirection => fields.wind_direction = value,
                        Field::WindSpeed => fields.wind_speed = value,
                        Field::Precipitation => fields.precipitation = value,
                        Field::Sunshine => fields.sunshine = value,
                        Field::PressureMsl => fields.pressure_msl = value,
                    }
                }

                if !any_field {
                    continue;
                }

                records.push(ParsedRecord {
                    source: source.clone(),
                    timestamp,
                    fields: fields.sanitized(),
                });
            }
        }

        Ok(records)
    }
}

fn text_of<'a>(node: &roxmltree::Node<'a, 'a>, tag: &str) -> Option<String> {
    node.descendants()
        .find(|n| n.has_tag_name(tag))
        .and_then(|n| n.text())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_forecast_value_tokens() {
        let values: Vec<Option<f64>> = "12.3 - 14.5"
            .split_whitespace()
            .map(|token| if token == "-" { None } else { token.parse::<f64>().ok() })
            .collect();
        assert_eq!(values, vec![Some(12.3), None, Some(14.5)]);
    }
}
