//! Built-in scalar functions
//!
//! Every function has a fixed arity, checked when a query is compiled. A null
//! argument makes the result null.

use crate::error::SqlError;
use crate::timestamp::{format_timestamp, parse_timestamp};
use crate::Result;
use tidewater_catalog::FieldType;
use tidewater_core::Value;

/// Mean earth radius in kilometres
const EARTH_RADIUS_KM: f64 = 6371.0;
/// Mean earth radius in miles
const EARTH_RADIUS_MI: f64 = 3959.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    MaskLeft,
    MaskRight,
    Mask,
    GeoDistance,
    TimestampToString,
    StringToTimestamp,
    Concat,
    Ucase,
    Lcase,
}

const ALL: [Function; 9] = [
    Function::MaskLeft,
    Function::MaskRight,
    Function::Mask,
    Function::GeoDistance,
    Function::TimestampToString,
    Function::StringToTimestamp,
    Function::Concat,
    Function::Ucase,
    Function::Lcase,
];

impl Function {
    /// Case-insensitive lookup
    pub fn lookup(name: &str) -> Result<Self> {
        ALL.iter()
            .copied()
            .find(|f| f.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| SqlError::UnknownFunction(name.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::MaskLeft => "mask_left",
            Function::MaskRight => "mask_right",
            Function::Mask => "mask",
            Function::GeoDistance => "geo_distance",
            Function::TimestampToString => "timestamp_to_string",
            Function::StringToTimestamp => "string_to_timestamp",
            Function::Concat => "concat",
            Function::Ucase => "ucase",
            Function::Lcase => "lcase",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Function::MaskLeft | Function::MaskRight => 3,
            Function::Mask => 2,
            Function::GeoDistance => 5,
            Function::TimestampToString | Function::StringToTimestamp => 2,
            Function::Concat => 2,
            Function::Ucase | Function::Lcase => 1,
        }
    }

    pub fn check_arity(&self, actual: usize) -> Result<()> {
        if actual != self.arity() {
            return Err(SqlError::ArityError {
                function: self.name().to_string(),
                expected: self.arity(),
                actual,
            });
        }
        Ok(())
    }

    pub fn return_type(&self) -> FieldType {
        match self {
            Function::GeoDistance => FieldType::Double,
            Function::StringToTimestamp => FieldType::Integer,
            _ => FieldType::Text,
        }
    }

    pub fn invoke(&self, args: &[Value]) -> Result<Value> {
        self.check_arity(args.len())?;
        if args.iter().any(Value::is_null) {
            return Ok(Value::Null);
        }

        let name = self.name();
        match self {
            Function::MaskLeft | Function::MaskRight => {
                let text = text_arg(name, args, 0)?;
                let count = count_arg(name, args, 1)?;
                let mask = mask_char(name, args, 2)?;
                let len = text.chars().count();
                let masked: String = text
                    .chars()
                    .enumerate()
                    .map(|(i, c)| {
                        let hidden = match self {
                            Function::MaskLeft => i < count,
                            _ => i + count >= len,
                        };
                        if hidden {
                            mask
                        } else {
                            c
                        }
                    })
                    .collect();
                Ok(Value::Text(masked))
            }
            Function::Mask => {
                let text = text_arg(name, args, 0)?;
                let mask = mask_char(name, args, 1)?;
                Ok(Value::Text(text.chars().map(|_| mask).collect()))
            }
            Function::GeoDistance => {
                let lat1 = number_arg(name, args, 0)?;
                let lon1 = number_arg(name, args, 1)?;
                let lat2 = number_arg(name, args, 2)?;
                let lon2 = number_arg(name, args, 3)?;
                let radius = match text_arg(name, args, 4)?.to_ascii_uppercase().as_str() {
                    "KM" | "KMS" | "KILOMETERS" | "KILOMETRES" => EARTH_RADIUS_KM,
                    "MI" | "MILES" => EARTH_RADIUS_MI,
                    other => {
                        return Err(SqlError::EvaluationError(format!(
                            "geo_distance: unknown unit '{other}'"
                        )))
                    }
                };
                for lat in [lat1, lat2] {
                    if !(-90.0..=90.0).contains(&lat) {
                        return Err(SqlError::EvaluationError(format!(
                            "geo_distance: latitude {lat} out of range"
                        )));
                    }
                }
                for lon in [lon1, lon2] {
                    if !(-180.0..=180.0).contains(&lon) {
                        return Err(SqlError::EvaluationError(format!(
                            "geo_distance: longitude {lon} out of range"
                        )));
                    }
                }
                Ok(Value::Double(haversine(lat1, lon1, lat2, lon2) * radius))
            }
            Function::TimestampToString => {
                let millis = args[0].as_i64().ok_or_else(|| type_error(name, 0, "integer", &args[0]))?;
                let pattern = text_arg(name, args, 1)?;
                format_timestamp(millis, pattern).map(Value::Text)
            }
            Function::StringToTimestamp => {
                let text = text_arg(name, args, 0)?;
                let pattern = text_arg(name, args, 1)?;
                parse_timestamp(text, pattern)
                    .map(Value::Int)
                    .map_err(|e| SqlError::EvaluationError(e.to_string()))
            }
            Function::Concat => {
                let mut out = String::new();
                for (i, arg) in args.iter().enumerate() {
                    if arg.is_structured() {
                        return Err(type_error(name, i, "scalar", arg));
                    }
                    out.push_str(&arg.to_string());
                }
                Ok(Value::Text(out))
            }
            Function::Ucase => Ok(Value::Text(text_arg(name, args, 0)?.to_uppercase())),
            Function::Lcase => Ok(Value::Text(text_arg(name, args, 0)?.to_lowercase())),
        }
    }
}

/// Central angle between two points, in radians
fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * a.sqrt().min(1.0).asin()
}

fn type_error(function: &str, index: usize, expected: &str, found: &Value) -> SqlError {
    SqlError::EvaluationError(format!(
        "{function}: argument {} must be {expected}, got {}",
        index + 1,
        found.type_name()
    ))
}

fn text_arg<'a>(function: &str, args: &'a [Value], index: usize) -> Result<&'a str> {
    args[index]
        .as_str()
        .ok_or_else(|| type_error(function, index, "text", &args[index]))
}

fn number_arg(function: &str, args: &[Value], index: usize) -> Result<f64> {
    args[index]
        .as_f64()
        .ok_or_else(|| type_error(function, index, "numeric", &args[index]))
}

fn count_arg(function: &str, args: &[Value], index: usize) -> Result<usize> {
    match args[index] {
        Value::Int(n) if n >= 0 => Ok(n as usize),
        Value::Int(n) => Err(SqlError::EvaluationError(format!(
            "{function}: count must not be negative, got {n}"
        ))),
        ref other => Err(type_error(function, index, "integer", other)),
    }
}

fn mask_char(function: &str, args: &[Value], index: usize) -> Result<char> {
    let text = text_arg(function, args, index)?;
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(SqlError::EvaluationError(format!(
            "{function}: mask must be a single character, got '{text}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Vec<Value>) -> Result<Value> {
        Function::lookup(name)?.invoke(&args)
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(Function::lookup("MASK_LEFT").unwrap(), Function::MaskLeft);
        assert_eq!(Function::lookup("Geo_Distance").unwrap(), Function::GeoDistance);
        assert!(matches!(
            Function::lookup("explode"),
            Err(SqlError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_arity_error() {
        let err = call("mask_left", vec![Value::from("abc")]).unwrap_err();
        assert!(matches!(
            err,
            SqlError::ArityError { expected: 3, actual: 1, .. }
        ));
    }

    #[test]
    fn test_mask_left_and_right() {
        let args = |n: i64| vec![Value::from("4111-2222"), Value::Int(n), Value::from("X")];
        assert_eq!(call("mask_left", args(4)).unwrap(), Value::from("XXXX-2222"));
        assert_eq!(call("mask_right", args(4)).unwrap(), Value::from("4111-XXXX"));
        assert_eq!(call("mask_right", args(0)).unwrap(), Value::from("4111-2222"));
        assert_eq!(call("mask_left", args(50)).unwrap(), Value::from("XXXXXXXXX"));
    }

    #[test]
    fn test_mask_handles_multibyte() {
        assert_eq!(
            call("mask_right", vec![Value::from("Zürich"), Value::Int(3), Value::from("*")]).unwrap(),
            Value::from("Zür***")
        );
        assert_eq!(
            call("mask", vec![Value::from("héllo"), Value::from("#")]).unwrap(),
            Value::from("#####")
        );
    }

    #[test]
    fn test_mask_argument_errors() {
        assert!(matches!(
            call("mask_left", vec![Value::from("abc"), Value::Int(-1), Value::from("X")]),
            Err(SqlError::EvaluationError(_))
        ));
        assert!(matches!(
            call("mask_left", vec![Value::from("abc"), Value::Int(1), Value::from("XY")]),
            Err(SqlError::EvaluationError(_))
        ));
        assert!(matches!(
            call("mask_left", vec![Value::Int(5), Value::Int(1), Value::from("X")]),
            Err(SqlError::EvaluationError(_))
        ));
    }

    #[test]
    fn test_null_argument_propagates() {
        assert_eq!(
            call("mask_left", vec![Value::Null, Value::Int(1), Value::from("X")]).unwrap(),
            Value::Null
        );
        assert_eq!(
            call("concat", vec![Value::from("a"), Value::Null]).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_geo_distance() {
        // London to Paris
        let args = |unit: &str| {
            vec![
                Value::Double(51.5074),
                Value::Double(-0.1278),
                Value::Double(48.8566),
                Value::Double(2.3522),
                Value::from(unit),
            ]
        };
        let km = call("geo_distance", args("KM")).unwrap().as_f64().unwrap();
        assert!((km - 343.5).abs() < 1.0, "got {km}");

        let mi = call("geo_distance", args("miles")).unwrap().as_f64().unwrap();
        assert!((mi - 213.5).abs() < 1.0, "got {mi}");
    }

    #[test]
    fn test_geo_distance_same_point_and_integers() {
        let d = call(
            "geo_distance",
            vec![Value::Int(10), Value::Int(20), Value::Int(10), Value::Int(20), Value::from("km")],
        )
        .unwrap();
        assert_eq!(d, Value::Double(0.0));
    }

    #[test]
    fn test_geo_distance_rejects_bad_input() {
        let bad_unit = vec![
            Value::Int(0),
            Value::Int(0),
            Value::Int(1),
            Value::Int(1),
            Value::from("parsecs"),
        ];
        assert!(call("geo_distance", bad_unit).is_err());

        let bad_lat = vec![
            Value::Int(91),
            Value::Int(0),
            Value::Int(1),
            Value::Int(1),
            Value::from("km"),
        ];
        assert!(call("geo_distance", bad_lat).is_err());
    }

    #[test]
    fn test_timestamp_functions() {
        let formatted = call(
            "timestamp_to_string",
            vec![Value::Int(1_534_963_500_000), Value::from("yyyy-MM-dd HH:mm")],
        )
        .unwrap();
        assert_eq!(formatted, Value::from("2018-08-22 18:45"));

        let parsed = call(
            "string_to_timestamp",
            vec![Value::from("2018-08-22 18:45"), Value::from("yyyy-MM-dd HH:mm")],
        )
        .unwrap();
        assert_eq!(parsed, Value::Int(1_534_963_500_000));
    }

    #[test]
    fn test_string_to_timestamp_failure_is_evaluation_error() {
        let err = call(
            "string_to_timestamp",
            vec![Value::from("garbage"), Value::from("yyyy-MM-dd")],
        )
        .unwrap_err();
        assert!(matches!(err, SqlError::EvaluationError(_)));
    }

    #[test]
    fn test_concat_and_case() {
        assert_eq!(
            call("concat", vec![Value::from("E05-"), Value::Int(7)]).unwrap(),
            Value::from("E05-7")
        );
        assert_eq!(
            call("concat", vec![Value::from("v"), Value::Double(1.0)]).unwrap(),
            Value::from("v1.0")
        );
        assert!(matches!(
            call("concat", vec![Value::from("a"), Value::Seq(vec![])]),
            Err(SqlError::EvaluationError(_))
        ));
        assert_eq!(call("ucase", vec![Value::from("abc")]).unwrap(), Value::from("ABC"));
        assert_eq!(call("lcase", vec![Value::from("ABC")]).unwrap(), Value::from("abc"));
    }
}
