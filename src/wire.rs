use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use rust_decimal::Decimal;
use tokio::net::TcpStream;

use crate::auth::{parse_principal, PrincipalClaim, RoomdAuthSource};
use crate::engine::{verify_webhook, CheckoutSession, Engine, EngineError, PaymentOutcome};
use crate::model::*;
use crate::observability::{command_label, AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, Shape, SqlError};

pub struct RoomdHandler {
    engine: Arc<Engine>,
    webhook_secret: String,
    query_parser: Arc<RoomdQueryParser>,
}

impl RoomdHandler {
    pub fn new(engine: Arc<Engine>, webhook_secret: String) -> Self {
        Self {
            engine,
            webhook_secret,
            query_parser: Arc::new(RoomdQueryParser),
        }
    }

    /// The startup `user` names the principal. Ids are checked against the
    /// engine on every query, so deactivated admins lose access at once.
    fn resolve_principal<C: ClientInfo>(&self, client: &C) -> PgWireResult<Principal> {
        let user = client.metadata().get("user").map(String::as_str).unwrap_or_default();
        let claim = parse_principal(user).map_err(|e| auth_err(e.to_string()))?;
        let principal = match claim {
            PrincipalClaim::Anonymous => Some(Principal::Anonymous),
            PrincipalClaim::Visitor(id) => self.engine.visitor_principal(id),
            PrincipalClaim::Admin(id) => self.engine.admin_principal(id),
        };
        principal.ok_or_else(|| auth_err(format!("no such principal: {user}")))
    }

    async fn run(&self, principal: &Principal, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(principal, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, p: &Principal, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertRoom { room, returning } => {
                let room = engine.create_room(p, room).await.map_err(engine_err)?;
                Ok(written("INSERT", returning, || room_rows(&[room])))
            }
            Command::UpdateRoom { id, changes, returning } => {
                let room = engine.update_room(p, id, changes).await.map_err(engine_err)?;
                Ok(written("UPDATE", returning, || room_rows(&[room])))
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(p, id).await.map_err(engine_err)?;
                Ok(tag("DELETE"))
            }
            Command::InsertWindow { window, returning } => {
                let window = engine.add_availability(p, window).await.map_err(engine_err)?;
                Ok(written("INSERT", returning, || window_rows(&[window])))
            }
            Command::DeleteWindow { id } => {
                engine.remove_availability(p, id).await.map_err(engine_err)?;
                Ok(tag("DELETE"))
            }
            Command::InsertVisitor { visitor, returning } => {
                let visitor = engine.register_visitor(visitor).await.map_err(engine_err)?;
                Ok(written("INSERT", returning, || visitor_rows(&[visitor])))
            }
            Command::UpdateVisitor { id, changes, returning } => {
                let visitor = self.update_visitor(p, id, changes).await.map_err(engine_err)?;
                Ok(written("UPDATE", returning, || visitor_rows(&[visitor])))
            }
            Command::InsertAdmin { admin, returning } => {
                let admin = engine.register_admin(p, admin).await.map_err(engine_err)?;
                Ok(written("INSERT", returning, || admin_rows(&[admin])))
            }
            Command::InsertBooking { booking, returning } => {
                let booking = engine.create_booking(p, booking).await.map_err(engine_err)?;
                Ok(written("INSERT", returning, || booking_rows(&[booking])))
            }
            Command::UpdateBooking { id, changes, returning } => {
                let booking = engine.update_booking(p, id, changes).await.map_err(engine_err)?;
                Ok(written("UPDATE", returning, || booking_rows(&[booking])))
            }
            Command::ApproveBooking {
                id,
                admin_notes,
                returning,
            } => {
                let booking = engine.approve_booking(p, id, admin_notes).await.map_err(engine_err)?;
                Ok(written("UPDATE", returning, || booking_rows(&[booking])))
            }
            Command::RejectBooking { id, reason, returning } => {
                let booking = engine.reject_booking(p, id, reason).await.map_err(engine_err)?;
                Ok(written("UPDATE", returning, || booking_rows(&[booking])))
            }
            Command::CancelBooking { id, reason, returning } => {
                let booking = engine.cancel_booking(p, id, reason).await.map_err(engine_err)?;
                Ok(written("UPDATE", returning, || booking_rows(&[booking])))
            }
            Command::InsertCheckout { booking } => {
                let session = engine.start_checkout(p, booking).await.map_err(engine_err)?;
                Ok(checkout_rows(&session))
            }
            Command::InsertPaymentEvent { payload, signature } => {
                let event = verify_webhook(payload.as_bytes(), &signature, &self.webhook_secret, engine.now())
                    .map_err(engine_err)?;
                let outcome = engine.handle_payment_event(event).await.map_err(engine_err)?;
                Ok(payment_outcome_rows(&outcome))
            }
            Command::SelectRooms { id: Some(id), filter } if filter.predicates.is_empty() => {
                let rooms = match engine.get_room(id).await {
                    Ok(room) => vec![room],
                    Err(EngineError::NotFound { .. }) => Vec::new(),
                    Err(e) => return Err(engine_err(e)),
                };
                Ok(room_rows(&rooms))
            }
            Command::SelectRooms { id, filter } => {
                let mut rooms = engine.list_rooms(&filter).await.map_err(engine_err)?;
                if let Some(id) = id {
                    rooms.retain(|r| r.id == id);
                }
                Ok(room_rows(&rooms))
            }
            Command::SelectWindows { room_id } => {
                let windows = engine.room_availability(room_id).await.map_err(engine_err)?;
                Ok(window_rows(&windows))
            }
            Command::SelectBookings { filter } => {
                let bookings = engine.list_bookings(p, filter).await.map_err(engine_err)?;
                Ok(booking_rows(&bookings))
            }
            Command::SelectVisitors { id: Some(id) } => {
                let visitor = engine.get_visitor(p, id).map_err(engine_err)?;
                Ok(visitor_rows(&[visitor]))
            }
            Command::SelectVisitors { id: None } => {
                let visitors = engine.list_visitors(p).map_err(engine_err)?;
                Ok(visitor_rows(&visitors))
            }
            Command::SelectAdmins => {
                let admins = engine.list_admins(p).map_err(engine_err)?;
                Ok(admin_rows(&admins))
            }
            Command::SelectConflicts {
                room_id,
                date,
                span,
                exclude,
            } => {
                let conflicts = engine
                    .find_conflicts(room_id, date, span, exclude)
                    .await
                    .map_err(engine_err)?;
                Ok(conflict_rows(&conflicts))
            }
            Command::SelectSlot { room_id, date, span } => {
                let check = engine.check_slot(room_id, date, span).await.map_err(engine_err)?;
                Ok(slot_rows(&check))
            }
            Command::SelectFreeSlots { room_id, date } => {
                let slots = engine.free_slots(room_id, date).await.map_err(engine_err)?;
                Ok(free_slot_rows(room_id, date, &slots))
            }
            Command::SelectStats => {
                let stats = engine.stats(p).await.map_err(engine_err)?;
                Ok(stats_rows(&stats))
            }
        }
    }

    /// One UPDATE may carry profile fields, an activation flag, or both.
    /// Each half goes through its own authorization.
    async fn update_visitor(
        &self,
        p: &Principal,
        id: VisitorId,
        changes: VisitorChanges,
    ) -> Result<VisitorView, EngineError> {
        let activation = changes.is_active;
        let profile = VisitorChanges {
            is_active: None,
            ..changes
        };
        let mut view = None;
        if profile != VisitorChanges::default() {
            view = Some(self.engine.update_visitor_profile(p, id, profile).await?);
        }
        if let Some(active) = activation {
            view = Some(self.engine.set_visitor_active(p, id, active).await?);
        }
        match view {
            Some(v) => Ok(v),
            None => self.engine.get_visitor(p, id),
        }
    }
}

#[async_trait]
impl SimpleQueryHandler for RoomdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let principal = self.resolve_principal(client)?;
        Ok(vec![self.run(&principal, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomdQueryParser;

#[async_trait]
impl QueryParser for RoomdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(sql::statement_shape(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomdHandler {
    type Statement = String;
    type QueryParser = RoomdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let principal = self.resolve_principal(client)?;
        let sql = substitute_params(portal);
        self.run(&principal, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for(sql::statement_shape(&target.statement)),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for(sql::statement_shape(
            &target.statement.statement,
        ))))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn schema_for(shape: Shape) -> Vec<FieldInfo> {
    match shape {
        Shape::Empty => vec![],
        Shape::Rooms => room_schema(),
        Shape::Windows => window_schema(),
        Shape::Bookings => booking_schema(),
        Shape::Visitors => visitor_schema(),
        Shape::Admins => admin_schema(),
        Shape::Conflicts => conflict_schema(),
        Shape::Slot => slot_schema(),
        Shape::FreeSlots => free_slot_schema(),
        Shape::Stats => stats_schema(),
        Shape::Checkout => checkout_schema(),
        Shape::PaymentOutcome => payment_outcome_schema(),
    }
}

fn room_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("room_number", Type::VARCHAR),
        field("room_name", Type::VARCHAR),
        field("description", Type::TEXT),
        field("capacity", Type::INT8),
        field("location", Type::VARCHAR),
        field("building", Type::VARCHAR),
        field("floor", Type::INT4),
        field("full_location", Type::VARCHAR),
        field("room_type", Type::VARCHAR),
        field("amenities", Type::VARCHAR),
        field("hourly_rate", Type::NUMERIC),
        field("is_available", Type::BOOL),
        field("requires_approval", Type::BOOL),
        field("created_at", Type::TIMESTAMPTZ),
        field("updated_at", Type::TIMESTAMPTZ),
    ]
}

fn window_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("room_id", Type::INT8),
        field("day_of_week", Type::INT4),
        field("start_time", Type::TIME),
        field("end_time", Type::TIME),
        field("is_available", Type::BOOL),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("booking_reference", Type::VARCHAR),
        field("room_id", Type::INT8),
        field("visitor_id", Type::INT8),
        field("booking_date", Type::DATE),
        field("start_time", Type::TIME),
        field("end_time", Type::TIME),
        field("purpose", Type::VARCHAR),
        field("description", Type::TEXT),
        field("expected_attendees", Type::INT8),
        field("status", Type::VARCHAR),
        field("total_cost", Type::NUMERIC),
        field("is_paid", Type::BOOL),
        field("admin_notes", Type::TEXT),
        field("cancellation_reason", Type::TEXT),
        field("approved_by", Type::INT8),
        field("approved_at", Type::TIMESTAMPTZ),
        field("payment_session_id", Type::VARCHAR),
        field("payment_date", Type::TIMESTAMPTZ),
        field("created_at", Type::TIMESTAMPTZ),
        field("updated_at", Type::TIMESTAMPTZ),
    ]
}

fn visitor_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("student_id", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("first_name", Type::VARCHAR),
        field("last_name", Type::VARCHAR),
        field("full_name", Type::VARCHAR),
        field("phone", Type::VARCHAR),
        field("user_type", Type::VARCHAR),
        field("department", Type::VARCHAR),
        field("is_active", Type::BOOL),
        field("email_verified", Type::BOOL),
        field("created_at", Type::TIMESTAMPTZ),
    ]
}

fn admin_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("username", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("first_name", Type::VARCHAR),
        field("last_name", Type::VARCHAR),
        field("role", Type::VARCHAR),
        field("is_active", Type::BOOL),
        field("created_at", Type::TIMESTAMPTZ),
    ]
}

fn conflict_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("booking_reference", Type::VARCHAR),
        field("start_time", Type::TIME),
        field("end_time", Type::TIME),
        field("status", Type::VARCHAR),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::INT8),
        field("booking_date", Type::DATE),
        field("start_time", Type::TIME),
        field("end_time", Type::TIME),
        field("is_available", Type::BOOL),
        field("within_open_hours", Type::BOOL),
        field("conflict_count", Type::INT8),
    ]
}

fn free_slot_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::INT8),
        field("booking_date", Type::DATE),
        field("start_time", Type::TIME),
        field("end_time", Type::TIME),
    ]
}

const STATS_COLUMNS: [&str; 11] = [
    "total_rooms",
    "available_rooms",
    "total_visitors",
    "active_visitors",
    "total_bookings",
    "pending_bookings",
    "approved_bookings",
    "rejected_bookings",
    "cancelled_bookings",
    "completed_bookings",
    "todays_bookings",
];

fn stats_schema() -> Vec<FieldInfo> {
    STATS_COLUMNS.iter().map(|c| field(c, Type::INT8)).collect()
}

fn checkout_schema() -> Vec<FieldInfo> {
    vec![
        field("session_id", Type::VARCHAR),
        field("url", Type::VARCHAR),
        field("booking_reference", Type::VARCHAR),
        field("total_cost", Type::NUMERIC),
        field("currency", Type::VARCHAR),
        field("expires_at", Type::TIMESTAMPTZ),
    ]
}

fn payment_outcome_schema() -> Vec<FieldInfo> {
    vec![
        field("outcome", Type::VARCHAR),
        field("booking_id", Type::INT8),
        field("booking_reference", Type::VARCHAR),
        field("session_id", Type::VARCHAR),
    ]
}

/// Encode `items` against `schema`, one row each.
fn rows<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn tag(command: &str) -> Response {
    Response::Execution(Tag::new(command).with_rows(1))
}

/// Command tag, or the written row when the statement said RETURNING.
fn written(command: &str, returning: bool, rows: impl FnOnce() -> Response) -> Response {
    if returning { rows() } else { tag(command) }
}

fn id(v: u64) -> i64 {
    v as i64
}

fn ts(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.f+00").to_string()
}

fn money(d: Decimal) -> String {
    format!("{d:.2}")
}

fn room_rows(rooms: &[Room]) -> Response {
    rows(room_schema(), rooms, |e, r| {
        e.encode_field(&id(r.id))?;
        e.encode_field(&r.room_number)?;
        e.encode_field(&r.room_name)?;
        e.encode_field(&r.description)?;
        e.encode_field(&i64::from(r.capacity))?;
        e.encode_field(&r.location)?;
        e.encode_field(&r.building)?;
        e.encode_field(&r.floor)?;
        e.encode_field(&full_location(r))?;
        e.encode_field(&r.room_type.as_str())?;
        e.encode_field(&r.amenities.join(","))?;
        e.encode_field(&money(r.hourly_rate))?;
        e.encode_field(&r.is_available)?;
        e.encode_field(&r.requires_approval)?;
        e.encode_field(&ts(r.created_at))?;
        e.encode_field(&ts(r.updated_at))
    })
}

fn window_rows(windows: &[AvailabilityWindow]) -> Response {
    rows(window_schema(), windows, |e, w| {
        e.encode_field(&id(w.id))?;
        e.encode_field(&id(w.room_id))?;
        e.encode_field(&i32::from(w.day_of_week))?;
        e.encode_field(&format_time_of_day(w.span.start))?;
        e.encode_field(&format_time_of_day(w.span.end))?;
        e.encode_field(&w.is_available)
    })
}

fn booking_rows(bookings: &[Booking]) -> Response {
    rows(booking_schema(), bookings, |e, b| {
        e.encode_field(&id(b.id))?;
        e.encode_field(&b.booking_reference)?;
        e.encode_field(&id(b.room_id))?;
        e.encode_field(&id(b.visitor_id))?;
        e.encode_field(&b.booking_date.to_string())?;
        e.encode_field(&format_time_of_day(b.span.start))?;
        e.encode_field(&format_time_of_day(b.span.end))?;
        e.encode_field(&b.purpose)?;
        e.encode_field(&b.description)?;
        e.encode_field(&i64::from(b.expected_attendees))?;
        e.encode_field(&b.status.as_str())?;
        e.encode_field(&money(b.total_cost))?;
        e.encode_field(&is_paid(b))?;
        e.encode_field(&b.admin_notes)?;
        e.encode_field(&b.cancellation_reason)?;
        e.encode_field(&b.approved_by.map(id))?;
        e.encode_field(&b.approved_at.map(ts))?;
        e.encode_field(&b.payment_session_id)?;
        e.encode_field(&b.payment_date.map(ts))?;
        e.encode_field(&ts(b.created_at))?;
        e.encode_field(&ts(b.updated_at))
    })
}

fn visitor_rows(visitors: &[VisitorView]) -> Response {
    rows(visitor_schema(), visitors, |e, v| {
        e.encode_field(&id(v.id))?;
        e.encode_field(&v.student_id)?;
        e.encode_field(&v.email)?;
        e.encode_field(&v.first_name)?;
        e.encode_field(&v.last_name)?;
        e.encode_field(&full_name(v))?;
        e.encode_field(&v.phone)?;
        e.encode_field(&v.user_type.as_str())?;
        e.encode_field(&v.department)?;
        e.encode_field(&v.is_active)?;
        e.encode_field(&v.email_verified)?;
        e.encode_field(&ts(v.created_at))
    })
}

fn admin_rows(admins: &[AdminView]) -> Response {
    rows(admin_schema(), admins, |e, a| {
        e.encode_field(&id(a.id))?;
        e.encode_field(&a.username)?;
        e.encode_field(&a.email)?;
        e.encode_field(&a.first_name)?;
        e.encode_field(&a.last_name)?;
        e.encode_field(&a.role.as_str())?;
        e.encode_field(&a.is_active)?;
        e.encode_field(&ts(a.created_at))
    })
}

fn conflict_rows(conflicts: &[ConflictInfo]) -> Response {
    rows(conflict_schema(), conflicts, |e, c| {
        e.encode_field(&id(c.id))?;
        e.encode_field(&c.booking_reference)?;
        e.encode_field(&format_time_of_day(c.start))?;
        e.encode_field(&format_time_of_day(c.end))?;
        e.encode_field(&c.status.as_str())
    })
}

fn slot_rows(check: &SlotCheck) -> Response {
    rows(slot_schema(), std::slice::from_ref(check), |e, c| {
        e.encode_field(&id(c.room_id))?;
        e.encode_field(&c.date.to_string())?;
        e.encode_field(&format_time_of_day(c.span.start))?;
        e.encode_field(&format_time_of_day(c.span.end))?;
        e.encode_field(&c.is_available)?;
        e.encode_field(&c.within_open_hours)?;
        e.encode_field(&(c.conflicts.len() as i64))
    })
}

fn free_slot_rows(room_id: RoomId, date: NaiveDate, slots: &[Span]) -> Response {
    let date = date.to_string();
    rows(free_slot_schema(), slots, |e, s| {
        e.encode_field(&id(room_id))?;
        e.encode_field(&date)?;
        e.encode_field(&format_time_of_day(s.start))?;
        e.encode_field(&format_time_of_day(s.end))
    })
}

fn stats_rows(stats: &Stats) -> Response {
    rows(stats_schema(), std::slice::from_ref(stats), |e, s| {
        for n in [
            s.total_rooms,
            s.available_rooms,
            s.total_visitors,
            s.active_visitors,
            s.total_bookings,
            s.pending_bookings,
            s.approved_bookings,
            s.rejected_bookings,
            s.cancelled_bookings,
            s.completed_bookings,
            s.todays_bookings,
        ] {
            e.encode_field(&(n as i64))?;
        }
        Ok(())
    })
}

fn checkout_rows(session: &CheckoutSession) -> Response {
    rows(checkout_schema(), std::slice::from_ref(session), |e, s| {
        e.encode_field(&s.session_id)?;
        e.encode_field(&s.url)?;
        e.encode_field(&s.booking_reference)?;
        e.encode_field(&money(s.total_cost))?;
        e.encode_field(&s.currency)?;
        e.encode_field(&ts(s.expires_at))
    })
}

fn payment_outcome_rows(outcome: &PaymentOutcome) -> Response {
    rows(payment_outcome_schema(), std::slice::from_ref(outcome), |e, o| {
        let (booking, session) = match o {
            PaymentOutcome::Created(b) | PaymentOutcome::Duplicate(b) => (Some(b), b.payment_session_id.clone()),
            PaymentOutcome::Expired { session_id } => (None, Some(session_id.clone())),
            PaymentOutcome::Ignored { .. } => (None, None),
        };
        e.encode_field(&o.label())?;
        e.encode_field(&booking.map(|b| id(b.id)))?;
        e.encode_field(&booking.map(|b| b.booking_reference.clone()))?;
        e.encode_field(&session)
    })
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomdFactory {
    handler: Arc<RoomdHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<RoomdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomdFactory {
    pub fn new(engine: Arc<Engine>, password: String, webhook_secret: String) -> Self {
        let auth_source = RoomdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomdHandler::new(engine, webhook_secret)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    webhook_secret: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(RoomdFactory::new(engine, password, webhook_secret));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn auth_err(message: String) -> PgWireError {
    metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
    user_error("28000", message)
}

/// SQLSTATE for an engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound { .. } => "P0002",
        EngineError::SlotConflict { .. } => "23P01",
        EngineError::Duplicate { .. } | EngineError::RoomInUse(_) => "23505",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::Forbidden(_) => "42501",
        EngineError::Validation(_) | EngineError::LimitExceeded(_) => "22023",
        EngineError::Transient(_) => "40001",
        EngineError::PaymentVerification(_) => "28000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let mut message = e.to_string();
    if let EngineError::SlotConflict { conflicts, .. } = &e {
        let refs: Vec<String> = conflicts
            .iter()
            .map(|c| {
                format!(
                    "{} [{}, {})",
                    c.booking_reference,
                    format_time_of_day(c.start),
                    format_time_of_day(c.end)
                )
            })
            .collect();
        message = format!("{message}: {}", refs.join(", "));
    }
    user_error(sqlstate(&e), message)
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn { .. } => "42703",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_takes_highest_index() {
        assert_eq!(count_params("SELECT * FROM bookings"), 0);
        assert_eq!(count_params("SELECT * FROM bookings WHERE id = $1"), 1);
        assert_eq!(count_params("INSERT INTO rooms (a, b) VALUES ($2, $10)"), 10);
    }

    #[test]
    fn engine_errors_map_to_sqlstates() {
        assert_eq!(sqlstate(&EngineError::not_found("booking", 1)), "P0002");
        assert_eq!(
            sqlstate(&EngineError::Duplicate {
                field: "email",
                value: "a@b.c".into()
            }),
            "23505"
        );
        assert_eq!(sqlstate(&EngineError::Forbidden("no")), "42501");
        assert_eq!(sqlstate(&EngineError::invalid("bad")), "22023");
        assert_eq!(sqlstate(&EngineError::Transient("slow".into())), "40001");
        assert_eq!(sqlstate(&EngineError::PaymentVerification("sig".into())), "28000");
    }

    #[test]
    fn timestamps_render_like_postgres() {
        use chrono::TimeZone;
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap();
        assert_eq!(ts(t), "2026-03-01 08:30:00+00");
        assert_eq!(money(Decimal::new(25, 0)), "25.00");
    }
}
