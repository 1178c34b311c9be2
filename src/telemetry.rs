// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::env;
use std::fmt::Debug;

use tracing::{Event, Subscriber, field};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::format::{self, Writer};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{Layer, Registry, prelude::*};

const TARGET_PREFIX: &str = "gke_metadata_agent::";

type BoxLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Installs the global subscriber. `LOG_FORMAT=json` switches to one JSON object per line;
/// `RUST_LOG` overrides the default `info` filter.
pub fn setup_logging() {
    let format = match env::var("LOG_FORMAT").as_deref() {
        Ok("json") => json_fmt(),
        _ => plain_fmt(),
    };
    tracing_subscriber::registry()
        .with(format.with_filter(env_filter()))
        .init();
}

fn json_fmt() -> BoxLayer {
    let format = tracing_subscriber::fmt::format().json().flatten_event(true);
    Box::new(
        tracing_subscriber::fmt::layer()
            .event_format(format)
            .fmt_fields(format::JsonFields::default()),
    )
}

fn plain_fmt() -> BoxLayer {
    Box::new(
        tracing_subscriber::fmt::layer()
            .event_format(PlainFormat)
            .fmt_fields(PlainFormat),
    )
}

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_regex(false)
        .from_env_lossy()
}

/// PlainFormat writes `time\tlevel\ttarget\tmessage\tk=v k=v`.
struct PlainFormat;

struct Visitor<'writer> {
    res: std::fmt::Result,
    first: bool,
    writer: Writer<'writer>,
}

impl Visitor<'_> {
    fn write_field(&mut self, value: &impl Debug) -> std::fmt::Result {
        let sep = if std::mem::replace(&mut self.first, false) {
            ""
        } else {
            " "
        };
        write!(self.writer, "{sep}{value:?}")
    }
}

impl field::Visit for Visitor<'_> {
    fn record_str(&mut self, field: &field::Field, value: &str) {
        self.record_debug(field, &value)
    }

    fn record_debug(&mut self, field: &field::Field, value: &dyn Debug) {
        if self.res.is_err() {
            return;
        }
        self.res = match field.name() {
            "message" => write!(self.writer, "{value:?}\t"),
            name => self.write_field(&format_args!("{name}={value:?}")),
        }
    }
}

impl<'writer> FormatFields<'writer> for PlainFormat {
    fn format_fields<R: tracing_subscriber::field::RecordFields>(
        &self,
        writer: Writer<'writer>,
        fields: R,
    ) -> std::fmt::Result {
        let mut visitor = Visitor {
            res: Ok(()),
            first: true,
            writer,
        };
        fields.record(&mut visitor);
        visitor.res
    }
}

impl<S, N> FormatEvent<S, N> for PlainFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        use tracing_log::NormalizeEvent;
        use tracing_subscriber::fmt::time::{FormatTime, SystemTime};

        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());
        SystemTime.format_time(&mut writer)?;
        write!(
            writer,
            "\t{}\t",
            meta.level().to_string().to_ascii_lowercase()
        )?;
        let target = meta.target();
        write!(
            writer,
            "{}",
            target.strip_prefix(TARGET_PREFIX).unwrap_or(target)
        )?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, ":{}", span.metadata().name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
            }
        }
        if event.fields().next().is_some() {
            write!(writer, "\t")?;
        }
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
