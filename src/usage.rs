use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CxError, CxResult};

const PRIMARY_DEFAULT_MINUTES: i64 = 300;
const SECONDARY_DEFAULT_MINUTES: i64 = 10_080;

/// Provider-agnostic quota view of one account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub primary: Option<UsageWindow>,
    pub secondary: Option<UsageWindow>,
    pub credits: Option<Credits>,
    pub plan_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageWindow {
    pub used_percent: Option<f64>,
    pub window_minutes: i64,
    pub resets_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credits {
    pub has_credits: Option<bool>,
    pub unlimited: Option<bool>,
    pub balance: Option<String>,
}

#[derive(Clone, Copy)]
enum WindowKind {
    Primary,
    Secondary,
}

impl WindowKind {
    fn name(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    fn default_minutes(self) -> i64 {
        match self {
            Self::Primary => PRIMARY_DEFAULT_MINUTES,
            Self::Secondary => SECONDARY_DEFAULT_MINUTES,
        }
    }
}

/// Raw window fields from one source, before defaults are applied.
#[derive(Default)]
struct WindowFields {
    used_percent: Option<f64>,
    window_minutes: Option<i64>,
    reset_at: Option<DateTime<Utc>>,
    reset_after_seconds: Option<i64>,
}

impl WindowFields {
    fn is_empty(&self) -> bool {
        self.used_percent.is_none()
            && self.window_minutes.is_none()
            && self.reset_at.is_none()
            && self.reset_after_seconds.is_none()
    }
}

/// `None` when the offset does not fit a timestamp.
fn relative_reset(request_time: DateTime<Utc>, seconds: i64) -> Option<DateTime<Utc>> {
    chrono::Duration::try_seconds(seconds).and_then(|offset| request_time.checked_add_signed(offset))
}

impl UsageSnapshot {
    /// Builds a snapshot from the REST usage reply. Header values take
    /// precedence over body values field by field; relative reset times are
    /// evaluated against `request_time`.
    pub fn from_http(headers: &HeaderMap, body: &Value, request_time: DateTime<Utc>) -> Self {
        let primary = merge_window(
            WindowKind::Primary,
            header_window(headers, WindowKind::Primary),
            body_window(body, WindowKind::Primary),
            request_time,
        );
        let secondary = merge_window(
            WindowKind::Secondary,
            header_window(headers, WindowKind::Secondary),
            body_window(body, WindowKind::Secondary),
            request_time,
        );

        let body_credits = body.get("credits").filter(|value| value.is_object());
        let credits = Credits {
            has_credits: header_value(headers, "x-codex-credits-has-credits")
                .and_then(parse_bool_str)
                .or_else(|| body_credits.and_then(|c| c.get("has_credits")).and_then(parse_bool_value)),
            unlimited: header_value(headers, "x-codex-credits-unlimited")
                .and_then(parse_bool_str)
                .or_else(|| body_credits.and_then(|c| c.get("unlimited")).and_then(parse_bool_value)),
            balance: header_value(headers, "x-codex-credits-balance")
                .map(str::to_string)
                .or_else(|| body_credits.and_then(|c| c.get("balance")).and_then(scalar_as_string)),
        };

        Self {
            primary,
            secondary,
            credits: (credits != Credits::default()).then_some(credits),
            plan_type: body.get("plan_type").and_then(scalar_as_string),
        }
    }

    /// Builds a snapshot from an `account/rateLimits/read` result.
    pub fn from_rpc_result(result: &Value) -> CxResult<Self> {
        let limits = first_field(result, &["rateLimits", "rate_limits"])
            .filter(|value| value.is_object())
            .ok_or_else(|| {
                CxError::ProviderFetchFailed("rate limits missing from RPC result".to_string())
            })?;

        let rpc_window = |kind: WindowKind| {
            let window = limits.get(kind.name()).filter(|value| value.is_object())?;
            let fields = WindowFields {
                used_percent: first_field(window, &["usedPercent", "used_percent"]).and_then(value_as_f64),
                window_minutes: first_field(
                    window,
                    &["windowDurationMins", "window_duration_mins", "window_minutes"],
                )
                .and_then(value_as_f64)
                .map(|minutes| minutes.round() as i64),
                reset_at: first_field(window, &["resetsAt", "resets_at"]).and_then(parse_date_value),
                reset_after_seconds: None,
            };
            finish_window(kind, &fields, None, Utc::now())
        };

        let credits = first_field(limits, &["credits"])
            .filter(|value| value.is_object())
            .map(|credits| Credits {
                has_credits: first_field(credits, &["hasCredits", "has_credits"]).and_then(parse_bool_value),
                unlimited: credits.get("unlimited").and_then(parse_bool_value),
                balance: credits.get("balance").and_then(scalar_as_string),
            });

        Ok(Self {
            primary: rpc_window(WindowKind::Primary),
            secondary: rpc_window(WindowKind::Secondary),
            credits,
            plan_type: first_field(limits, &["planType", "plan_type"])
                .or_else(|| first_field(result, &["planType", "plan_type"]))
                .and_then(scalar_as_string),
        })
    }
}

fn merge_window(
    kind: WindowKind,
    headers: WindowFields,
    body: WindowFields,
    request_time: DateTime<Utc>,
) -> Option<UsageWindow> {
    if headers.is_empty() && body.is_empty() {
        return None;
    }
    finish_window(kind, &headers, Some(&body), request_time)
}

fn finish_window(
    kind: WindowKind,
    primary: &WindowFields,
    fallback: Option<&WindowFields>,
    request_time: DateTime<Utc>,
) -> Option<UsageWindow> {
    let empty = WindowFields::default();
    let fallback = fallback.unwrap_or(&empty);
    if primary.is_empty() && fallback.is_empty() {
        return None;
    }
    Some(UsageWindow {
        used_percent: primary
            .used_percent
            .or(fallback.used_percent)
            .map(|percent| percent.clamp(0.0, 100.0)),
        window_minutes: primary
            .window_minutes
            .or(fallback.window_minutes)
            .filter(|minutes| *minutes > 0)
            .unwrap_or_else(|| kind.default_minutes()),
        // An absolute reset time from either source beats a relative one.
        resets_at: primary.reset_at.or(fallback.reset_at).or_else(|| {
            primary
                .reset_after_seconds
                .or(fallback.reset_after_seconds)
                .and_then(|seconds| relative_reset(request_time, seconds))
        }),
    })
}

fn header_window(headers: &HeaderMap, kind: WindowKind) -> WindowFields {
    let field = |suffix: &str| {
        header_value(headers, &format!("x-codex-{}-{}", kind.name(), suffix))
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|value| value.is_finite())
    };
    WindowFields {
        used_percent: field("used-percent"),
        window_minutes: field("window-minutes").map(|minutes| minutes.round() as i64),
        reset_at: field("reset-at").and_then(|seconds| DateTime::from_timestamp(seconds as i64, 0)),
        reset_after_seconds: field("reset-after-seconds").map(|seconds| seconds.round() as i64),
    }
}

fn body_window(body: &Value, kind: WindowKind) -> WindowFields {
    let key = format!("{}_window", kind.name());
    let window = body
        .get("rate_limit")
        .and_then(|limits| limits.get(&key))
        .or_else(|| body.get(&key))
        .filter(|value| value.is_object());
    let Some(window) = window else {
        return WindowFields::default();
    };
    WindowFields {
        used_percent: window.get("used_percent").and_then(value_as_f64),
        window_minutes: window
            .get("limit_window_seconds")
            .and_then(value_as_f64)
            .map(|seconds| (seconds / 60.0).round() as i64),
        reset_at: window
            .get("reset_at")
            .and_then(value_as_f64)
            .and_then(|seconds| DateTime::from_timestamp(seconds as i64, 0)),
        reset_after_seconds: window
            .get("reset_after_seconds")
            .and_then(value_as_f64)
            .map(|seconds| seconds.round() as i64),
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn first_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find(|value| !value.is_null())
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn scalar_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) if !raw.trim().is_empty() => Some(raw.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn parse_bool_str(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_bool_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_i64().map(|value| value != 0),
        Value::String(raw) => parse_bool_str(raw),
        _ => None,
    }
}

/// Epoch seconds or milliseconds, numeric strings, or RFC 3339.
fn parse_date_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => number.as_f64().and_then(date_from_timestamp),
        Value::String(raw) => {
            if let Ok(number) = raw.trim().parse::<f64>() {
                return date_from_timestamp(number);
            }
            DateTime::parse_from_rfc3339(raw.trim())
                .ok()
                .map(|date| date.with_timezone(&Utc))
        }
        _ => None,
    }
}

fn date_from_timestamp(timestamp: f64) -> Option<DateTime<Utc>> {
    if !timestamp.is_finite() || timestamp <= 0.0 {
        return None;
    }
    let milliseconds = if timestamp > 1_000_000_000_000.0 {
        timestamp
    } else {
        timestamp * 1000.0
    };
    DateTime::<Utc>::from_timestamp_millis(milliseconds.round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};
    use serde_json::json;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn header_percent_beats_body_percent() {
        let body = json!({
            "plan_type": "plus",
            "rate_limit": {"primary_window": {"used_percent": 10, "reset_at": 1_900_000_000}}
        });
        let snapshot = UsageSnapshot::from_http(
            &headers(&[("x-codex-primary-used-percent", "25")]),
            &body,
            Utc::now(),
        );

        let primary = snapshot.primary.expect("primary window");
        assert_eq!(primary.used_percent, Some(25.0));
        assert_eq!(primary.window_minutes, 300);
        assert_eq!(primary.resets_at.map(|at| at.timestamp()), Some(1_900_000_000));
        assert!(snapshot.secondary.is_none());
        assert_eq!(snapshot.plan_type.as_deref(), Some("plus"));
    }

    #[test]
    fn relative_reset_uses_request_time_and_durations_convert() {
        let request_time = DateTime::from_timestamp(1_700_000_000, 0).expect("time");
        let body = json!({
            "secondary_window": {
                "used_percent": 140.0,
                "limit_window_seconds": 604_800,
                "reset_after_seconds": 3_600
            }
        });
        let snapshot = UsageSnapshot::from_http(&HeaderMap::new(), &body, request_time);

        let secondary = snapshot.secondary.expect("secondary window");
        assert_eq!(secondary.used_percent, Some(100.0));
        assert_eq!(secondary.window_minutes, 10_080);
        assert_eq!(
            secondary.resets_at,
            Some(request_time + chrono::Duration::seconds(3_600))
        );
    }

    #[test]
    fn absolute_body_reset_beats_relative_header_reset() {
        let request_time = DateTime::from_timestamp(1_700_000_000, 0).expect("time");
        let body = json!({"rate_limit": {"primary_window": {"used_percent": 10, "reset_at": 1_900_000_000}}});
        let snapshot = UsageSnapshot::from_http(
            &headers(&[("x-codex-primary-reset-after-seconds", "60")]),
            &body,
            request_time,
        );
        let primary = snapshot.primary.expect("primary");
        assert_eq!(primary.resets_at.map(|at| at.timestamp()), Some(1_900_000_000));

        let snapshot = UsageSnapshot::from_http(
            &headers(&[("x-codex-primary-reset-after-seconds", "60")]),
            &json!({"rate_limit": {"primary_window": {"reset_after_seconds": 3_600}}}),
            request_time,
        );
        let primary = snapshot.primary.expect("primary");
        assert_eq!(primary.resets_at, Some(request_time + chrono::Duration::seconds(60)));
    }

    #[test]
    fn out_of_range_relative_reset_is_dropped() {
        let body = json!({"rate_limit": {"primary_window": {"used_percent": 10, "reset_after_seconds": 1e17}}});
        let snapshot = UsageSnapshot::from_http(&HeaderMap::new(), &body, Utc::now());
        let primary = snapshot.primary.expect("primary");
        assert_eq!(primary.used_percent, Some(10.0));
        assert!(primary.resets_at.is_none());

        let snapshot = UsageSnapshot::from_http(
            &headers(&[("x-codex-secondary-reset-after-seconds", "9e18")]),
            &Value::Null,
            Utc::now(),
        );
        assert!(snapshot.secondary.expect("secondary").resets_at.is_none());
    }

    #[test]
    fn header_only_reply_yields_windows_with_defaults_and_credits() {
        let snapshot = UsageSnapshot::from_http(
            &headers(&[
                ("x-codex-secondary-used-percent", "42.5"),
                ("x-codex-credits-has-credits", "True"),
                ("x-codex-credits-balance", "12.50"),
            ]),
            &Value::Null,
            Utc::now(),
        );
        let secondary = snapshot.secondary.expect("secondary");
        assert_eq!(secondary.used_percent, Some(42.5));
        assert_eq!(secondary.window_minutes, 10_080);
        let credits = snapshot.credits.expect("credits");
        assert_eq!(credits.has_credits, Some(true));
        assert_eq!(credits.balance.as_deref(), Some("12.50"));
        assert!(snapshot.primary.is_none());
    }

    #[test]
    fn rpc_result_accepts_both_spellings() {
        let camel = json!({
            "rateLimits": {
                "primary": {"usedPercent": 12, "windowDurationMins": 300, "resetsAt": 1_900_000_000},
                "secondary": null,
                "credits": {"hasCredits": false, "unlimited": false, "balance": "0"}
            }
        });
        let snapshot = UsageSnapshot::from_rpc_result(&camel).expect("camelCase");
        assert_eq!(snapshot.primary.as_ref().and_then(|w| w.used_percent), Some(12.0));
        assert!(snapshot.secondary.is_none());
        assert_eq!(snapshot.credits.and_then(|c| c.has_credits), Some(false));

        let snake = json!({"rate_limits": {"secondary": {"used_percent": 7, "resets_at": 1_900_000_000}}});
        let snapshot = UsageSnapshot::from_rpc_result(&snake).expect("snake_case");
        let secondary = snapshot.secondary.expect("secondary");
        assert_eq!(secondary.used_percent, Some(7.0));
        assert_eq!(secondary.window_minutes, 10_080);

        assert!(UsageSnapshot::from_rpc_result(&json!({})).is_err());
    }
}
