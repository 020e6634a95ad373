//! # Wire Protocol
//!
//! Newline-terminated UTF-8 text, one command per line. The verb is the first
//! token and is matched case-insensitively. Every line is decoded exactly once,
//! at the connection boundary, into a [`WireMessage`].
//!
//! ## Message Catalogue
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Line                               Variant            Direction        │
//! │  ─────────────────────────────────  ─────────────────  ──────────────── │
//! │  IDENTIFY          (IDENTIFICAR)    Identify           parent → child   │
//! │  ID:<id>                            Id                 child → parent   │
//! │  OK: <text>                         Ok                 reply            │
//! │  ERROR: <text>                      Error              reply            │
//! │  PENDIENTE: <text>                  Pending            pump reply       │
//! │  ACK                                Ack                reply            │
//! │  SALIR                              Quit               either           │
//! │  PRICE <c> <price> (PRECIO)         Price              parent → child   │
//! │  TRANSACCION <unit> <c> <qty>       Transaction        pump → distrib.  │
//! │  ESTADO_SURTIDOR                    StatusRequest      distrib. → pump  │
//! │  ESTADO:<id>|<c>:<p>:<q>:<n>;...    Status             pump → distrib.  │
//! │  REPORTE:<text>                     Report             child → parent   │
//! │  REPORTE_AUTOMATICO <text>          AutomaticReport    distrib. → co.   │
//! │  EXTRAER <c> <qty>                  Extract            pump → tank      │
//! │  REPONER <c> <qty>                  Replenish          operator → tank  │
//! │  CONSULTAR <c>                      LevelQuery         any → tank       │
//! │  ESTADO                             TankStatus         any → tank       │
//! │  anything else                      Other              logged           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A known verb with the wrong number of arguments, a non-numeric amount or
//! an unknown commodity is a [`ProtocolError`]; the receiver answers it with
//! an `ERROR:` line and keeps the connection open.

use std::fmt;

use fuelnet_core::validation::validate_unit_id;
use fuelnet_core::{Commodity, Liters, Price, UnitStatus};
use thiserror::Error;

// =============================================================================
// Protocol Errors
// =============================================================================

/// A line that uses a known verb incorrectly.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Wrong number of arguments.
    #[error("{verb} expects {expected} argument(s), got {got}")]
    WrongArity {
        verb: &'static str,
        expected: usize,
        got: usize,
    },

    /// Commodity name is not a known grade.
    #[error("Unknown commodity: {0}")]
    UnknownCommodity(String),

    /// An argument could not be parsed.
    #[error("Invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// `ESTADO:` body did not parse.
    #[error("Invalid status report: {0}")]
    MalformedStatus(String),
}

impl ProtocolError {
    /// The `ERROR:` reply sent back to whoever sent the bad line.
    pub fn to_reply(&self) -> WireMessage {
        WireMessage::Error(self.to_string())
    }
}

// =============================================================================
// Wire Message
// =============================================================================

/// One decoded protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Handshake challenge from a parent.
    Identify,
    /// Handshake answer carrying the child's id.
    Id(String),
    Ok(String),
    Error(String),
    /// A price change was accepted but deferred until the current sale ends.
    Pending(String),
    Ack,
    /// Close this connection.
    Quit,
    /// New price for one commodity.
    Price { commodity: Commodity, price: Price },
    /// One sale made by a pump.
    Transaction {
        unit_id: String,
        commodity: Commodity,
        quantity: Liters,
    },
    /// Ask a pump for its totals.
    StatusRequest,
    /// A pump's totals.
    Status(UnitStatus),
    /// Free-form report from a child.
    Report(String),
    /// Periodic digest from a distributor to the company.
    AutomaticReport(String),
    /// Take fuel from the tank.
    Extract { commodity: Commodity, quantity: Liters },
    /// Add fuel to the tank.
    Replenish { commodity: Commodity, quantity: Liters },
    /// Ask the tank for one level.
    LevelQuery { commodity: Commodity },
    /// Ask the tank for every level.
    TankStatus,
    /// Unrecognised line, kept verbatim.
    Other(String),
}

impl WireMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Identify => "IDENTIFY",
            WireMessage::Id(_) => "ID",
            WireMessage::Ok(_) => "OK",
            WireMessage::Error(_) => "ERROR",
            WireMessage::Pending(_) => "PENDIENTE",
            WireMessage::Ack => "ACK",
            WireMessage::Quit => "SALIR",
            WireMessage::Price { .. } => "PRICE",
            WireMessage::Transaction { .. } => "TRANSACCION",
            WireMessage::StatusRequest => "ESTADO_SURTIDOR",
            WireMessage::Status(_) => "ESTADO:",
            WireMessage::Report(_) => "REPORTE",
            WireMessage::AutomaticReport(_) => "REPORTE_AUTOMATICO",
            WireMessage::Extract { .. } => "EXTRAER",
            WireMessage::Replenish { .. } => "REPONER",
            WireMessage::LevelQuery { .. } => "CONSULTAR",
            WireMessage::TankStatus => "ESTADO",
            WireMessage::Other(_) => "OTHER",
        }
    }

    /// Replies and handshake answers that need no reply of their own.
    pub fn is_acknowledgement(&self) -> bool {
        matches!(
            self,
            WireMessage::Id(_)
                | WireMessage::Ok(_)
                | WireMessage::Error(_)
                | WireMessage::Pending(_)
                | WireMessage::Ack
        )
    }

    pub fn ok(text: impl Into<String>) -> Self {
        WireMessage::Ok(text.into())
    }

    pub fn error(text: impl Into<String>) -> Self {
        WireMessage::Error(text.into())
    }

    /// Decodes one line.
    ///
    /// Returns `Ok(None)` for a blank line.
    pub fn decode(line: &str) -> Result<Option<WireMessage>, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        // Colon-prefixed forms carry free text after the prefix.
        if let Some(rest) = strip_prefix_ci(line, "ID:") {
            let id = rest.trim();
            if id.is_empty() || id.contains(char::is_whitespace) {
                return Err(ProtocolError::InvalidValue {
                    field: "id",
                    reason: format!("'{}'", id),
                });
            }
            return Ok(Some(WireMessage::Id(id.to_string())));
        }
        if let Some(rest) = strip_prefix_ci(line, "OK:") {
            return Ok(Some(WireMessage::Ok(rest.trim().to_string())));
        }
        if let Some(rest) = strip_prefix_ci(line, "ERROR:") {
            return Ok(Some(WireMessage::Error(rest.trim().to_string())));
        }
        if let Some(rest) = strip_prefix_ci(line, "PENDIENTE:") {
            return Ok(Some(WireMessage::Pending(rest.trim().to_string())));
        }
        if let Some(rest) = strip_prefix_ci(line, "ESTADO:") {
            let status = UnitStatus::parse_body(rest)
                .map_err(|e| ProtocolError::MalformedStatus(e.to_string()))?;
            return Ok(Some(WireMessage::Status(status)));
        }
        if let Some(rest) = strip_prefix_ci(line, "REPORTE:") {
            return Ok(Some(WireMessage::Report(rest.trim().to_string())));
        }

        let mut tokens = line.split_whitespace();
        let verb = tokens.next().unwrap_or_default().to_ascii_uppercase();
        let args: Vec<&str> = tokens.collect();

        let message = match verb.as_str() {
            "IDENTIFY" | "IDENTIFICAR" => WireMessage::Identify,
            "OK" if args.is_empty() => WireMessage::Ok(String::new()),
            "ACK" => WireMessage::Ack,
            "SALIR" | "QUIT" => WireMessage::Quit,
            "PRICE" | "PRECIO" => {
                arity("PRICE", &args, 2)?;
                WireMessage::Price {
                    commodity: commodity(args[0])?,
                    price: price(args[1])?,
                }
            }
            "TRANSACCION" | "TRANSACTION" => {
                arity("TRANSACCION", &args, 3)?;
                WireMessage::Transaction {
                    unit_id: unit_id(args[0])?,
                    commodity: commodity(args[1])?,
                    quantity: liters(args[2])?,
                }
            }
            "ESTADO_SURTIDOR" => WireMessage::StatusRequest,
            "REPORTE_AUTOMATICO" => WireMessage::AutomaticReport(rest_after_verb(line)),
            "EXTRAER" => {
                arity("EXTRAER", &args, 2)?;
                WireMessage::Extract {
                    commodity: commodity(args[0])?,
                    quantity: liters(args[1])?,
                }
            }
            "REPONER" => {
                arity("REPONER", &args, 2)?;
                WireMessage::Replenish {
                    commodity: commodity(args[0])?,
                    quantity: liters(args[1])?,
                }
            }
            "CONSULTAR" => {
                arity("CONSULTAR", &args, 1)?;
                WireMessage::LevelQuery {
                    commodity: commodity(args[0])?,
                }
            }
            "ESTADO" => WireMessage::TankStatus,
            _ => WireMessage::Other(line.to_string()),
        };

        Ok(Some(message))
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireMessage::Identify => write!(f, "IDENTIFY"),
            WireMessage::Id(id) => write!(f, "ID:{}", one_line(id)),
            WireMessage::Ok(text) if text.is_empty() => write!(f, "OK"),
            WireMessage::Ok(text) => write!(f, "OK: {}", one_line(text)),
            WireMessage::Error(text) => write!(f, "ERROR: {}", one_line(text)),
            WireMessage::Pending(text) => write!(f, "PENDIENTE: {}", one_line(text)),
            WireMessage::Ack => write!(f, "ACK"),
            WireMessage::Quit => write!(f, "SALIR"),
            WireMessage::Price { commodity, price } => write!(f, "PRICE {} {}", commodity, price),
            WireMessage::Transaction {
                unit_id,
                commodity,
                quantity,
            } => write!(f, "TRANSACCION {} {} {}", unit_id, commodity, quantity),
            WireMessage::StatusRequest => write!(f, "ESTADO_SURTIDOR"),
            WireMessage::Status(status) => write!(f, "ESTADO:{}", status.to_body()),
            WireMessage::Report(text) => write!(f, "REPORTE:{}", one_line(text)),
            WireMessage::AutomaticReport(text) => {
                write!(f, "REPORTE_AUTOMATICO {}", one_line(text))
            }
            WireMessage::Extract {
                commodity,
                quantity,
            } => write!(f, "EXTRAER {} {}", commodity, quantity),
            WireMessage::Replenish {
                commodity,
                quantity,
            } => write!(f, "REPONER {} {}", commodity, quantity),
            WireMessage::LevelQuery { commodity } => write!(f, "CONSULTAR {}", commodity),
            WireMessage::TankStatus => write!(f, "ESTADO"),
            WireMessage::Other(line) => write!(f, "{}", one_line(line)),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

fn rest_after_verb(line: &str) -> String {
    line.split_once(char::is_whitespace)
        .map(|(_, rest)| rest.trim().to_string())
        .unwrap_or_default()
}

fn arity(verb: &'static str, args: &[&str], expected: usize) -> Result<(), ProtocolError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(ProtocolError::WrongArity {
            verb,
            expected,
            got: args.len(),
        })
    }
}

fn unit_id(raw: &str) -> Result<String, ProtocolError> {
    validate_unit_id(raw).map_err(|e| ProtocolError::InvalidValue {
        field: "unit id",
        reason: e.to_string(),
    })
}

fn commodity(raw: &str) -> Result<Commodity, ProtocolError> {
    raw.parse()
        .map_err(|_| ProtocolError::UnknownCommodity(raw.to_string()))
}

fn liters(raw: &str) -> Result<Liters, ProtocolError> {
    Liters::parse_bounded("quantity", raw).map_err(|e| ProtocolError::InvalidValue {
        field: "quantity",
        reason: e.to_string(),
    })
}

fn price(raw: &str) -> Result<Price, ProtocolError> {
    raw.parse().map_err(|e: fuelnet_core::ValidationError| ProtocolError::InvalidValue {
        field: "price",
        reason: e.to_string(),
    })
}

/// Free text must never smuggle a line break onto the wire.
fn one_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use fuelnet_core::FuelTotals;

    fn decode(line: &str) -> WireMessage {
        WireMessage::decode(line).unwrap().unwrap()
    }

    #[test]
    fn test_handshake_lines() {
        assert_eq!(decode("IDENTIFY"), WireMessage::Identify);
        assert_eq!(decode("identificar"), WireMessage::Identify);
        assert_eq!(decode("ID:3"), WireMessage::Id("3".into()));
        assert_eq!(decode("id: Norte "), WireMessage::Id("Norte".into()));
        assert!(WireMessage::decode("ID:").is_err());
    }

    #[test]
    fn test_replies() {
        assert_eq!(decode("OK: Transaction recorded"), WireMessage::ok("Transaction recorded"));
        assert_eq!(decode("OK"), WireMessage::ok(""));
        assert_eq!(decode("ERROR: nope"), WireMessage::error("nope"));
        assert_eq!(decode("PENDIENTE: later"), WireMessage::Pending("later".into()));
        assert_eq!(decode("ack"), WireMessage::Ack);
        assert!(decode("ACK").is_acknowledgement());
    }

    #[test]
    fn test_price_accepts_both_spellings() {
        let expected = WireMessage::Price {
            commodity: Commodity::Diesel,
            price: Price::from_whole(950),
        };
        assert_eq!(decode("PRICE Diesel 950"), expected);
        assert_eq!(decode("precio diesel 950"), expected);
        assert_eq!(expected.to_string(), "PRICE Diesel 950");
    }

    #[test]
    fn test_transaction() {
        let msg = decode("TRANSACCION 2 93 5.5");
        assert_eq!(
            msg,
            WireMessage::Transaction {
                unit_id: "2".into(),
                commodity: Commodity::Gasoline93,
                quantity: "5.5".parse().unwrap(),
            }
        );
        assert_eq!(msg.to_string(), "TRANSACCION 2 93 5.5");
    }

    #[test]
    fn test_malformed_known_verbs() {
        assert_eq!(
            WireMessage::decode("TRANSACCION 2 93"),
            Err(ProtocolError::WrongArity {
                verb: "TRANSACCION",
                expected: 3,
                got: 2
            })
        );
        assert!(matches!(
            WireMessage::decode("PRICE Diesel abc"),
            Err(ProtocolError::InvalidValue { field: "price", .. })
        ));
        assert!(matches!(
            WireMessage::decode("PRICE Diesel -1"),
            Err(ProtocolError::InvalidValue { field: "price", .. })
        ));
        assert_eq!(
            WireMessage::decode("EXTRAER 98 10"),
            Err(ProtocolError::UnknownCommodity("98".into()))
        );
    }

    #[test]
    fn test_out_of_range_quantities_are_refused() {
        let err = WireMessage::decode("TRANSACCION 7 93 79228162514264337593543950335").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidValue { field: "quantity", .. }));
        assert_eq!(
            err.to_reply().to_string(),
            "ERROR: Invalid quantity: quantity must be at most 1000000000"
        );
        assert!(WireMessage::decode("REPONER 93 1000000001").is_err());
        assert!(WireMessage::decode("EXTRAER 93 0.0004").is_err());
        assert!(WireMessage::decode("TRANSACCION 7 93 0.001").is_ok());
    }

    #[test]
    fn test_error_reply_line() {
        let err = WireMessage::decode("EXTRAER 93").unwrap_err();
        assert_eq!(
            err.to_reply().to_string(),
            "ERROR: EXTRAER expects 2 argument(s), got 1"
        );
    }

    #[test]
    fn test_status_round_trip() {
        let status = UnitStatus {
            unit_id: "1".into(),
            fuels: vec![(
                Commodity::Gasoline95,
                FuelTotals {
                    price: Price::from_whole(100),
                    dispensed: Liters::from_whole(10),
                    sale_count: 1,
                },
            )],
        };
        let line = WireMessage::Status(status.clone()).to_string();
        assert_eq!(line, "ESTADO:1|95:100:10:1;");
        assert_eq!(decode(&line), WireMessage::Status(status));
        assert!(WireMessage::decode("ESTADO:1|95:x:10:1;").is_err());
    }

    #[test]
    fn test_status_verbs_do_not_collide() {
        assert_eq!(decode("ESTADO"), WireMessage::TankStatus);
        assert_eq!(decode("estado_surtidor"), WireMessage::StatusRequest);
        assert!(matches!(decode("ESTADO:2|"), WireMessage::Status(_)));
    }

    #[test]
    fn test_reports() {
        assert_eq!(decode("REPORTE: all good"), WireMessage::Report("all good".into()));
        assert_eq!(
            decode("REPORTE_AUTOMATICO Norte|93: 13 L"),
            WireMessage::AutomaticReport("Norte|93: 13 L".into())
        );
    }

    #[test]
    fn test_tank_verbs() {
        assert_eq!(
            decode("EXTRAER 95 10"),
            WireMessage::Extract {
                commodity: Commodity::Gasoline95,
                quantity: Liters::from_whole(10)
            }
        );
        assert_eq!(
            decode("CONSULTAR kerosene"),
            WireMessage::LevelQuery {
                commodity: Commodity::Kerosene
            }
        );
        assert_eq!(decode("salir"), WireMessage::Quit);
    }

    #[test]
    fn test_blank_and_unknown_lines() {
        assert_eq!(WireMessage::decode("   ").unwrap(), None);
        assert_eq!(decode("hello there"), WireMessage::Other("hello there".into()));
    }

    #[test]
    fn test_encoding_strips_line_breaks() {
        assert_eq!(WireMessage::error("a\nb").to_string(), "ERROR: a b");
    }
}
