use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::engine::{Engine, ErrorKind, NewInstance, ReservationError};
use crate::limits::{MAX_ALTERNATIVES, MAX_LINE_LEN};
use crate::model::*;
use crate::observability;

/// One request line. Tagged by `op`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    AcquireHold {
        session_instance_id: InstanceId,
        holder_id: HolderId,
    },
    ReleaseHold {
        session_instance_id: InstanceId,
        holder_id: HolderId,
    },
    GetHold {
        session_instance_id: InstanceId,
    },
    CheckConflict {
        swimmer_id: SwimmerId,
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    ResolveRecurring {
        /// 0 = Sunday … 6 = Saturday.
        day_of_week: u8,
        time_of_day: NaiveTime,
        range_start: NaiveDate,
        range_end: NaiveDate,
        #[serde(default)]
        instructor_id: Option<InstructorId>,
    },
    ConfirmBooking {
        swimmer_id: SwimmerId,
        instance_ids: Vec<InstanceId>,
        /// Defaults to the swimmer id.
        #[serde(default)]
        holder_id: Option<HolderId>,
    },
    CancelBooking {
        booking_id: BookingId,
        swimmer_id: SwimmerId,
    },
    RescheduleBooking {
        booking_id: BookingId,
        swimmer_id: SwimmerId,
        new_session_instance_id: InstanceId,
    },
    CancelSeries {
        swimmer_id: SwimmerId,
        series_id: SeriesId,
    },
    ListBookings {
        swimmer_id: SwimmerId,
    },
    ListInstances {
        range_start: NaiveDate,
        range_end: NaiveDate,
        #[serde(default)]
        instructor_id: Option<InstructorId>,
        #[serde(default)]
        location: Option<String>,
    },
    CreateInstance {
        instance: NewInstance,
    },
    SuggestAlternatives {
        session_instance_id: InstanceId,
        #[serde(default)]
        limit: Option<usize>,
    },
    Watch {
        session_instance_id: InstanceId,
    },
}

/// One response line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        result: serde_json::Value,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Event {
        session_instance_id: InstanceId,
        event: Event,
    },
}

impl From<ReservationError> for Response {
    fn from(e: ReservationError) -> Self {
        Response::Error {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

fn to_result(value: impl Serialize) -> Result<serde_json::Value, ReservationError> {
    serde_json::to_value(value).map_err(|e| ReservationError::invalid(e.to_string()))
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "request line too long")
        }
    }
}

fn encode(response: &Response) -> io::Result<String> {
    serde_json::to_string(response).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Per-connection `watch` subscriptions. Each forwards one instance's
/// broadcast channel into the connection's event queue.
struct Watches {
    tx: mpsc::Sender<Event>,
    tasks: HashMap<InstanceId, JoinHandle<()>>,
}

impl Watches {
    fn watch(&mut self, engine: &Engine, instance_id: InstanceId) {
        if self.tasks.contains_key(&instance_id) {
            return;
        }
        let mut rx = engine.notify.subscribe(instance_id);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("watcher on {instance_id} lagged, {n} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks.insert(instance_id, task);
    }
}

impl Drop for Watches {
    fn drop(&mut self) {
        for task in self.tasks.values() {
            task.abort();
        }
    }
}

async fn dispatch(
    engine: &Engine,
    watches: &mut Watches,
    req: Request,
) -> Result<serde_json::Value, ReservationError> {
    match req {
        Request::AcquireHold {
            session_instance_id,
            holder_id,
        } => to_result(engine.acquire_hold(session_instance_id, &holder_id).await?),
        Request::ReleaseHold {
            session_instance_id,
            holder_id,
        } => {
            engine.release_hold(session_instance_id, &holder_id).await?;
            Ok(serde_json::Value::Null)
        }
        Request::GetHold {
            session_instance_id,
        } => to_result(engine.get_hold(session_instance_id).await?),
        Request::CheckConflict {
            swimmer_id,
            start,
            end,
        } => to_result(engine.check_conflict(swimmer_id, Span { start, end }).await?),
        Request::ResolveRecurring {
            day_of_week,
            time_of_day,
            range_start,
            range_end,
            instructor_id,
        } => {
            let day_of_week = RecurringPattern::weekday_from_index(day_of_week).ok_or_else(|| {
                ReservationError::invalid(format!("day_of_week {day_of_week} is not in 0-6"))
            })?;
            let pattern = RecurringPattern {
                day_of_week,
                time_of_day,
                range_start,
                range_end,
                instructor_id,
            };
            to_result(engine.resolve_recurring(&pattern).await?)
        }
        Request::ConfirmBooking {
            swimmer_id,
            instance_ids,
            holder_id,
        } => {
            let holder_id = holder_id.unwrap_or_else(|| swimmer_id.to_string());
            to_result(
                engine
                    .confirm_booking_as(swimmer_id, holder_id, instance_ids)
                    .await?,
            )
        }
        Request::CancelBooking {
            booking_id,
            swimmer_id,
        } => to_result(engine.cancel_booking(booking_id, swimmer_id).await?),
        Request::RescheduleBooking {
            booking_id,
            swimmer_id,
            new_session_instance_id,
        } => to_result(
            engine
                .reschedule_booking(booking_id, swimmer_id, new_session_instance_id)
                .await?,
        ),
        Request::CancelSeries {
            swimmer_id,
            series_id,
        } => to_result(engine.cancel_series(swimmer_id, series_id).await?),
        Request::ListBookings { swimmer_id } => {
            to_result(engine.swimmer_bookings(swimmer_id).await)
        }
        Request::ListInstances {
            range_start,
            range_end,
            instructor_id,
            location,
        } => {
            let filter = InstanceFilter {
                range_start,
                range_end,
                instructor_id,
                location,
            };
            to_result(engine.find_instances(&filter).await?)
        }
        Request::CreateInstance { instance } => to_result(engine.create_instance(instance).await?),
        Request::SuggestAlternatives {
            session_instance_id,
            limit,
        } => to_result(
            engine
                .suggest_alternatives(session_instance_id, limit.unwrap_or(MAX_ALTERNATIVES))
                .await?,
        ),
        Request::Watch {
            session_instance_id,
        } => {
            if engine.get_instance(session_instance_id).await.is_none() {
                return Err(ReservationError::NotFound(session_instance_id));
            }
            watches.watch(engine, session_instance_id);
            Ok(serde_json::json!({ "watching": session_instance_id }))
        }
    }
}

async fn handle_line(engine: &Engine, watches: &mut Watches, line: &str) -> Response {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => "invalid", "status" => "error")
                .increment(1);
            return ReservationError::invalid(format!("malformed request: {e}")).into();
        }
    };

    let op = observability::request_label(&req);
    let start = Instant::now();
    let result = dispatch(engine, watches, req).await;
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(start.elapsed().as_secs_f64());

    match result {
        Ok(result) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => "ok")
                .increment(1);
            Response::Ok { result }
        }
        Err(e) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => "error")
                .increment(1);
            if e.is_fatal() {
                warn!("{op} failed: {e}");
            } else {
                debug!("{op} refused: {e}");
            }
            e.into()
        }
    }
}

/// Serve one client: newline-delimited JSON requests in, one response line per
/// request out, plus event lines for watched instances.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (tx, mut events) = mpsc::channel(256);
    let mut watches = Watches {
        tx,
        tasks: HashMap::new(),
    };

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let response: Response =
                            ReservationError::invalid("request line too long").into();
                        framed.send(encode(&response)?).await.map_err(codec_err)?;
                        break;
                    }
                    Some(Err(e)) => return Err(codec_err(e)),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(&engine, &mut watches, &line).await;
                framed.send(encode(&response)?).await.map_err(codec_err)?;
            }
            Some(event) = events.recv() => {
                let response = Response::Event {
                    session_instance_id: event.session_instance_id(),
                    event,
                };
                framed.send(encode(&response)?).await.map_err(codec_err)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn requests_are_tagged_by_op() {
        let id = Ulid::new();
        let line = format!(r#"{{"op":"acquire_hold","session_instance_id":"{id}","holder_id":"s1"}}"#);
        let req: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(
            req,
            Request::AcquireHold {
                session_instance_id: id,
                holder_id: "s1".into()
            }
        );
        assert_eq!(observability::request_label(&req), "acquire_hold");
    }

    #[test]
    fn optional_fields_default() {
        let swimmer = Ulid::new();
        let line = format!(r#"{{"op":"confirm_booking","swimmer_id":"{swimmer}","instance_ids":[]}}"#);
        let req: Request = serde_json::from_str(&line).unwrap();
        assert!(matches!(req, Request::ConfirmBooking { holder_id: None, .. }));
    }

    #[test]
    fn recurring_request_parses_dates_and_times() {
        let line = r#"{"op":"resolve_recurring","day_of_week":1,"time_of_day":"15:00:00","range_start":"2024-01-01","range_end":"2024-01-31"}"#;
        let req: Request = serde_json::from_str(line).unwrap();
        match req {
            Request::ResolveRecurring {
                day_of_week,
                time_of_day,
                ..
            } => {
                assert_eq!(day_of_week, 1);
                assert_eq!(time_of_day, NaiveTime::from_hms_opt(15, 0, 0).unwrap());
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"op":"drop_table"}"#).is_err());
    }

    #[test]
    fn error_response_shape() {
        let id = Ulid::new();
        let response: Response = ReservationError::NotHolder(id).into();
        let v: serde_json::Value = serde_json::from_str(&encode(&response).unwrap()).unwrap();
        assert_eq!(v["status"], "error");
        assert_eq!(v["kind"], "NotHolder");
        assert!(v["message"].as_str().unwrap().contains(&id.to_string()));
    }

    #[test]
    fn ok_response_shape() {
        let response = Response::Ok {
            result: serde_json::json!({"has_conflict": false}),
        };
        let v: serde_json::Value = serde_json::from_str(&encode(&response).unwrap()).unwrap();
        assert_eq!(v["status"], "ok");
        assert_eq!(v["result"]["has_conflict"], false);
    }
}
