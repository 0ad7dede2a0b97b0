// 模板内置辅助函数与过滤器

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use minijinja::value::Rest;
use minijinja::{Environment, Error, ErrorKind, Value};
use std::collections::BTreeMap;
use std::fmt::Write;

/// 注册为全局函数的名字；静态分析时不视为上下文变量
pub(crate) const GLOBAL_FUNCTIONS: &[&str] = &[
    "now",
    "today",
    "add_days",
    "add_hours",
    "add_minutes",
    "days_between",
    "parse_date",
    "format_date",
    "split",
    "from_json",
    "to_dict",
    "range",
    "dict",
    "namespace",
    "debug",
];

/// 注册全部辅助函数与过滤器
pub fn register(env: &mut Environment<'static>) {
    env.add_function("now", now);
    env.add_function("today", today);
    env.add_function("add_days", add_days);
    env.add_function("add_hours", add_hours);
    env.add_function("add_minutes", add_minutes);
    env.add_function("days_between", days_between);
    env.add_function("parse_date", parse_date);
    env.add_function("format_date", format_date);
    env.add_function("split", split);
    env.add_function("from_json", from_json);
    env.add_function("to_dict", to_dict);

    env.add_filter("add_days", add_days);
    env.add_filter("add_hours", add_hours);
    env.add_filter("add_minutes", add_minutes);
    env.add_filter("parse_date", parse_date);
    env.add_filter("format_date", format_date);
    env.add_filter("split", split);
    env.add_filter("from_json", from_json);
    env.add_filter("to_dict", to_dict);
    env.add_filter("to_json", to_json);
    env.add_filter("format", format);
    env.add_filter("float", float);
    env.add_filter("int", int);
}

fn invalid(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, message.into())
}

/// 解析得到的时间点：保留“日期”或“日期时间”的原始精度
#[derive(Debug, Clone, Copy, PartialEq)]
enum Stamp {
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

impl Stamp {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(Stamp::DateTime(parsed.with_timezone(&Utc)));
        }
        for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
            if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, fmt) {
                return Some(Stamp::DateTime(parsed.and_utc()));
            }
        }
        for fmt in ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"] {
            if let Ok(parsed) = NaiveDate::parse_from_str(raw, fmt) {
                return Some(Stamp::Date(parsed));
            }
        }
        None
    }

    fn parse_with(raw: &str, fmt: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Stamp::DateTime(parsed.and_utc()));
        }
        NaiveDate::parse_from_str(raw, fmt).ok().map(Stamp::Date)
    }

    fn date(self) -> NaiveDate {
        match self {
            Stamp::Date(date) => date,
            Stamp::DateTime(datetime) => datetime.date_naive(),
        }
    }

    fn datetime(self) -> DateTime<Utc> {
        match self {
            Stamp::Date(date) => date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc(),
            Stamp::DateTime(datetime) => datetime,
        }
    }

    fn shift(self, delta: Duration) -> Option<Self> {
        match self {
            Stamp::Date(date) => date.checked_add_signed(delta).map(Stamp::Date),
            Stamp::DateTime(datetime) => datetime.checked_add_signed(delta).map(Stamp::DateTime),
        }
    }

    fn render(self) -> String {
        match self {
            Stamp::Date(date) => date.format("%Y-%m-%d").to_string(),
            Stamp::DateTime(datetime) => datetime.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// 格式串来自流程作者；无效说明符或对纯日期使用时间字段时返回 `None`
    fn format(self, fmt: &str) -> Option<String> {
        let mut out = String::new();
        let written = match self {
            Stamp::Date(date) => write!(out, "{}", date.format(fmt)),
            Stamp::DateTime(datetime) => write!(out, "{}", datetime.format(fmt)),
        };
        written.ok().map(|_| out)
    }
}

fn stamp_arg(value: &str, helper: &str) -> Result<Option<Stamp>, Error> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    Stamp::parse(value)
        .map(Some)
        .ok_or_else(|| invalid(format!("{}: cannot parse date '{}'", helper, value)))
}

/// `as_datetime` 时先提升为日期时间，按小时/分钟偏移
fn shifted(
    value: &str,
    delta: Option<Duration>,
    helper: &str,
    as_datetime: bool,
) -> Result<String, Error> {
    let Some(stamp) = stamp_arg(value, helper)? else {
        return Ok(String::new());
    };
    let delta = delta.ok_or_else(|| invalid(format!("{}: offset out of range", helper)))?;
    let stamp = if as_datetime {
        Stamp::DateTime(stamp.datetime())
    } else {
        stamp
    };
    stamp
        .shift(delta)
        .map(Stamp::render)
        .ok_or_else(|| invalid(format!("{}: date out of range", helper)))
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn today() -> String {
    Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

fn add_days(value: String, days: i64) -> Result<String, Error> {
    shifted(&value, Duration::try_days(days), "add_days", false)
}

fn add_hours(value: String, hours: i64) -> Result<String, Error> {
    shifted(&value, Duration::try_hours(hours), "add_hours", true)
}

fn add_minutes(value: String, minutes: i64) -> Result<String, Error> {
    shifted(&value, Duration::try_minutes(minutes), "add_minutes", true)
}

fn days_between(start: String, end: String) -> Result<i64, Error> {
    let start = stamp_arg(&start, "days_between")?;
    let end = stamp_arg(&end, "days_between")?;
    match (start, end) {
        (Some(start), Some(end)) => Ok((end.date() - start.date()).num_days()),
        _ => Ok(0),
    }
}

/// 规范化日期字符串；可选指定输入格式
fn parse_date(value: String, fmt: Option<String>) -> Result<String, Error> {
    if value.trim().is_empty() {
        return Ok(String::new());
    }
    let stamp = match fmt {
        Some(fmt) => Stamp::parse_with(&value, &fmt),
        None => Stamp::parse(&value),
    };
    stamp
        .map(Stamp::render)
        .ok_or_else(|| invalid(format!("parse_date: cannot parse date '{}'", value)))
}

fn format_date(value: String, fmt: Option<String>) -> Result<String, Error> {
    let fmt = fmt.unwrap_or_else(|| "%d %B %Y".to_string());
    match stamp_arg(&value, "format_date")? {
        Some(stamp) => stamp.format(&fmt).ok_or_else(|| {
            invalid(format!(
                "format_date: cannot format '{}' with '{}'",
                value.trim(),
                fmt
            ))
        }),
        None => Ok(String::new()),
    }
}

/// 按分隔符切分（默认逗号），去除空白与空项
fn split(value: String, separator: Option<String>) -> Vec<String> {
    let separator = separator.unwrap_or_else(|| ",".to_string());
    value
        .split(separator.as_str())
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn from_json(value: String) -> Result<Value, Error> {
    if value.trim().is_empty() {
        return Ok(Value::from(()));
    }
    let parsed: serde_json::Value = serde_json::from_str(&value)
        .map_err(|e| invalid(format!("from_json: {}", e)))?;
    Ok(Value::from_serialize(&parsed))
}

fn to_dict(value: String, separator: Option<String>, assign: Option<String>) -> Value {
    Value::from_serialize(pairs(&value, separator, assign))
}

/// `"a=1, b=2"` -> `{"a": "1", "b": "2"}`
fn pairs(value: &str, separator: Option<String>, assign: Option<String>) -> BTreeMap<String, String> {
    let separator = separator.unwrap_or_else(|| ",".to_string());
    let assign = assign.unwrap_or_else(|| "=".to_string());
    value
        .split(separator.as_str())
        .filter_map(|pair| {
            let (key, value) = pair.split_once(assign.as_str())?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn to_json(value: Value) -> Result<String, Error> {
    serde_json::to_string(&value).map_err(|e| invalid(format!("to_json: {}", e)))
}

fn number_of(value: &Value) -> Option<f64> {
    if let Some(raw) = value.as_str() {
        return raw.trim().parse::<f64>().ok();
    }
    if value.is_undefined() || value.is_none() {
        return None;
    }
    f64::try_from(value.clone()).ok()
}

/// 宽松的 float：无法转换时返回默认值（缺省 0.0）
fn float(value: Value, default: Option<f64>) -> f64 {
    number_of(&value).unwrap_or_else(|| default.unwrap_or(0.0))
}

fn int(value: Value, default: Option<i64>) -> i64 {
    if let Some(raw) = value.as_str() {
        if let Ok(parsed) = raw.trim().parse::<i64>() {
            return parsed;
        }
    }
    number_of(&value)
        .map(|n| n.trunc() as i64)
        .unwrap_or_else(|| default.unwrap_or(0))
}

/// printf 风格格式化：`"%.2f"|format(amount)`
///
/// 支持 `%s %d %i %f` 与精度，宽度与标志被忽略。
fn format(fmt: String, args: Rest<Value>) -> Result<String, Error> {
    printf(&fmt, &args)
}

pub(crate) fn printf(fmt: &str, args: &[Value]) -> Result<String, Error> {
    let mut out = String::with_capacity(fmt.len());
    let mut args = args.iter();
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let mut spec = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_digit() || matches!(next, '.' | '-' | '+' | ' ' | '#') {
                spec.push(next);
                chars.next();
            } else {
                break;
            }
        }
        let precision = spec
            .split_once('.')
            .and_then(|(_, precision)| precision.parse::<usize>().ok());
        let conversion = chars
            .next()
            .ok_or_else(|| invalid("format: incomplete format specifier"))?;
        let arg = args
            .next()
            .ok_or_else(|| invalid("format: not enough arguments"))?;
        match conversion {
            's' => {
                if !(arg.is_undefined() || arg.is_none()) {
                    out.push_str(&arg.to_string());
                }
            }
            'd' | 'i' => {
                let n = number_of(arg).unwrap_or(0.0).trunc() as i64;
                out.push_str(&n.to_string());
            }
            'f' | 'F' => {
                let n = number_of(arg).unwrap_or(0.0);
                out.push_str(&format!("{:.*}", precision.unwrap_or(6), n));
            }
            other => {
                return Err(invalid(format!("format: unsupported conversion %{}", other)));
            }
        }
    }
    Ok(out)
}
