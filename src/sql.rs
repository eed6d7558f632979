use std::collections::HashMap;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, LimitClause, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::filter::{BookingFilter, BookingPredicate, RoomFilter, RoomPredicate};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        room: NewRoom,
        returning: bool,
    },
    UpdateRoom {
        id: RoomId,
        changes: RoomChanges,
        returning: bool,
    },
    DeleteRoom {
        id: RoomId,
    },
    InsertWindow {
        window: NewWindow,
        returning: bool,
    },
    DeleteWindow {
        id: WindowId,
    },
    InsertVisitor {
        visitor: NewVisitor,
        returning: bool,
    },
    UpdateVisitor {
        id: VisitorId,
        changes: VisitorChanges,
        returning: bool,
    },
    InsertAdmin {
        admin: NewAdmin,
        returning: bool,
    },
    InsertBooking {
        booking: NewBooking,
        returning: bool,
    },
    UpdateBooking {
        id: BookingId,
        changes: BookingChanges,
        returning: bool,
    },
    ApproveBooking {
        id: BookingId,
        admin_notes: Option<String>,
        returning: bool,
    },
    RejectBooking {
        id: BookingId,
        reason: Option<String>,
        returning: bool,
    },
    CancelBooking {
        id: BookingId,
        reason: Option<String>,
        returning: bool,
    },
    /// Payment-gated booking request. Always answers with the session row.
    InsertCheckout {
        booking: NewBooking,
    },
    /// Provider webhook delivery: raw body plus signature header.
    InsertPaymentEvent {
        payload: String,
        signature: String,
    },
    SelectRooms {
        id: Option<RoomId>,
        filter: RoomFilter,
    },
    SelectWindows {
        room_id: RoomId,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectVisitors {
        id: Option<VisitorId>,
    },
    SelectAdmins,
    SelectConflicts {
        room_id: RoomId,
        date: NaiveDate,
        span: Span,
        exclude: Option<BookingId>,
    },
    SelectSlot {
        room_id: RoomId,
        date: NaiveDate,
        span: Span,
    },
    SelectFreeSlots {
        room_id: RoomId,
        date: NaiveDate,
    },
    SelectStats,
}

/// Row layout a statement answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Empty,
    Rooms,
    Windows,
    Bookings,
    Visitors,
    Admins,
    Conflicts,
    Slot,
    FreeSlots,
    Stats,
    Checkout,
    PaymentOutcome,
}

impl Command {
    pub fn shape(&self) -> Shape {
        match self {
            Command::InsertRoom { returning: true, .. } | Command::UpdateRoom { returning: true, .. } => {
                Shape::Rooms
            }
            Command::InsertWindow { returning: true, .. } => Shape::Windows,
            Command::InsertVisitor { returning: true, .. } | Command::UpdateVisitor { returning: true, .. } => {
                Shape::Visitors
            }
            Command::InsertAdmin { returning: true, .. } => Shape::Admins,
            Command::InsertBooking { returning: true, .. }
            | Command::UpdateBooking { returning: true, .. }
            | Command::ApproveBooking { returning: true, .. }
            | Command::RejectBooking { returning: true, .. }
            | Command::CancelBooking { returning: true, .. } => Shape::Bookings,
            Command::InsertCheckout { .. } => Shape::Checkout,
            Command::InsertPaymentEvent { .. } => Shape::PaymentOutcome,
            Command::SelectRooms { .. } => Shape::Rooms,
            Command::SelectWindows { .. } => Shape::Windows,
            Command::SelectBookings { .. } => Shape::Bookings,
            Command::SelectVisitors { .. } => Shape::Visitors,
            Command::SelectAdmins => Shape::Admins,
            Command::SelectConflicts { .. } => Shape::Conflicts,
            Command::SelectSlot { .. } => Shape::Slot,
            Command::SelectFreeSlots { .. } => Shape::FreeSlots,
            Command::SelectStats => Shape::Stats,
            _ => Shape::Empty,
        }
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match parse_statement(sql)? {
        Statement::Insert(insert) => parse_insert(&insert),
        Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => {
            let table = table_factor_name(&table.relation)?;
            parse_update(&table, &assignments, selection.as_ref(), returning.is_some())
        }
        Statement::Delete(delete) => parse_delete(&delete),
        Statement::Query(query) => parse_select(&query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Result layout of a statement without evaluating its values, so that
/// statements with `$n` placeholders can be described before binding.
pub fn statement_shape(sql: &str) -> Shape {
    let Ok(stmt) = parse_statement(sql) else {
        return Shape::Empty;
    };
    let (table, returning) = match &stmt {
        Statement::Insert(insert) => match insert_table_name(insert) {
            Ok(t) if t == "checkouts" => return Shape::Checkout,
            Ok(t) if t == "payment_events" => return Shape::PaymentOutcome,
            Ok(t) => (t, insert.returning.is_some()),
            Err(_) => return Shape::Empty,
        },
        Statement::Update { table, returning, .. } => match table_factor_name(&table.relation) {
            Ok(t) => (t, returning.is_some()),
            Err(_) => return Shape::Empty,
        },
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return Shape::Empty;
            };
            match select.from.first().map(|f| table_factor_name(&f.relation)) {
                Some(Ok(t)) => (t, true),
                _ => return Shape::Empty,
            }
        }
        _ => return Shape::Empty,
    };
    if !returning {
        return Shape::Empty;
    }
    match table.as_str() {
        "rooms" | "available_rooms" => Shape::Rooms,
        "room_availability" => Shape::Windows,
        "bookings" => Shape::Bookings,
        "visitors" => Shape::Visitors,
        "admins" => Shape::Admins,
        "conflicts" => Shape::Conflicts,
        "availability" => Shape::Slot,
        "free_slots" => Shape::FreeSlots,
        "stats" => Shape::Stats,
        _ => Shape::Empty,
    }
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    stmts.into_iter().next().ok_or(SqlError::Empty)
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let mut row = Row::from_insert(&table, insert)?;
    let returning = insert.returning.is_some();

    let cmd = match table.as_str() {
        "rooms" => Command::InsertRoom {
            room: NewRoom {
                room_number: row.required_text("room_number")?,
                room_name: row.required_text("room_name")?,
                description: row.text("description")?,
                capacity: row.required("capacity", as_u32)?,
                location: row.text("location")?,
                building: row.text("building")?,
                floor: row.optional("floor", as_i32)?,
                room_type: row.optional("room_type", as_enum)?.unwrap_or(RoomType::Classroom),
                amenities: row.optional("amenities", as_text_list)?.unwrap_or_default(),
                hourly_rate: row.optional("hourly_rate", as_decimal)?.unwrap_or(Decimal::ZERO),
                is_available: row.optional("is_available", as_bool)?.unwrap_or(true),
                requires_approval: row.optional("requires_approval", as_bool)?.unwrap_or(true),
            },
            returning,
        },
        "room_availability" => Command::InsertWindow {
            window: NewWindow {
                room_id: row.required("room_id", as_u64)?,
                day_of_week: row.required("day_of_week", as_u8)?,
                span: Span {
                    start: row.required("start_time", as_time)?,
                    end: row.required("end_time", as_time)?,
                },
                is_available: row.optional("is_available", as_bool)?.unwrap_or(true),
            },
            returning,
        },
        "visitors" => Command::InsertVisitor {
            visitor: NewVisitor {
                student_id: row.text("student_id")?,
                email: row.required_text("email")?,
                password_hash: row.required_text("password_hash")?,
                first_name: row.required_text("first_name")?,
                last_name: row.required_text("last_name")?,
                phone: row.text("phone")?,
                user_type: row.optional("user_type", as_enum)?.unwrap_or(UserType::Student),
                department: row.text("department")?,
            },
            returning,
        },
        "admins" => Command::InsertAdmin {
            admin: NewAdmin {
                username: row.required_text("username")?,
                email: row.required_text("email")?,
                password_hash: row.required_text("password_hash")?,
                first_name: row.required_text("first_name")?,
                last_name: row.required_text("last_name")?,
                role: row.optional("role", as_enum)?.unwrap_or(AdminRole::Admin),
            },
            returning,
        },
        "bookings" => Command::InsertBooking {
            booking: new_booking(&mut row)?,
            returning,
        },
        "checkouts" => Command::InsertCheckout {
            booking: new_booking(&mut row)?,
        },
        "payment_events" => Command::InsertPaymentEvent {
            payload: row.required_text("payload")?,
            signature: row.required_text("signature")?,
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    row.finish()?;
    Ok(cmd)
}

fn new_booking(row: &mut Row) -> Result<NewBooking, SqlError> {
    Ok(NewBooking {
        room_id: row.required("room_id", as_u64)?,
        booking_date: row.required("booking_date", as_date)?,
        span: Span {
            start: row.required("start_time", as_time)?,
            end: row.required("end_time", as_time)?,
        },
        purpose: row.required_text("purpose")?,
        description: row.text("description")?,
        expected_attendees: row.optional("expected_attendees", as_u32)?.unwrap_or(1),
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &str,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
    returning: bool,
) -> Result<Command, SqlError> {
    let id = extract_where_id(selection)?;
    let mut row = Row::from_assignments(table, assignments)?;

    let cmd = match table {
        "rooms" => Command::UpdateRoom {
            id,
            changes: RoomChanges {
                room_number: row.text("room_number")?,
                room_name: row.text("room_name")?,
                description: row.text("description")?,
                capacity: row.optional("capacity", as_u32)?,
                location: row.text("location")?,
                building: row.text("building")?,
                floor: row.optional("floor", as_i32)?,
                room_type: row.optional("room_type", as_enum)?,
                amenities: row.optional("amenities", as_text_list)?,
                hourly_rate: row.optional("hourly_rate", as_decimal)?,
                is_available: row.optional("is_available", as_bool)?,
                requires_approval: row.optional("requires_approval", as_bool)?,
            },
            returning,
        },
        "visitors" => Command::UpdateVisitor {
            id,
            changes: VisitorChanges {
                first_name: row.text("first_name")?,
                last_name: row.text("last_name")?,
                phone: row.text("phone")?,
                department: row.text("department")?,
                is_active: row.optional("is_active", as_bool)?,
            },
            returning,
        },
        "bookings" => parse_booking_update(id, &mut row, returning)?,
        _ => return Err(SqlError::UnknownTable(table.to_string())),
    };
    row.finish()?;
    Ok(cmd)
}

/// `SET status = ...` drives a transition; any other SET is a visitor edit.
/// The two cannot be mixed.
fn parse_booking_update(id: BookingId, row: &mut Row, returning: bool) -> Result<Command, SqlError> {
    if let Some(status) = row.optional("status", as_enum::<BookingStatus>)? {
        let cmd = match status {
            BookingStatus::Approved => Command::ApproveBooking {
                id,
                admin_notes: row.text("admin_notes")?,
                returning,
            },
            BookingStatus::Rejected => Command::RejectBooking {
                id,
                reason: row.text("cancellation_reason")?,
                returning,
            },
            BookingStatus::Cancelled => Command::CancelBooking {
                id,
                reason: row.text("cancellation_reason")?,
                returning,
            },
            other => {
                return Err(SqlError::Unsupported(format!("cannot set status to {other}")));
            }
        };
        if !row.is_empty() {
            return Err(SqlError::Unsupported(
                "status changes cannot be combined with other columns".into(),
            ));
        }
        return Ok(cmd);
    }

    let start = row.optional("start_time", as_time)?;
    let end = row.optional("end_time", as_time)?;
    let span = match (start, end) {
        (Some(start), Some(end)) => Some(Span { start, end }),
        (None, None) => None,
        _ => return Err(SqlError::MissingColumn("start_time and end_time must change together")),
    };
    Ok(Command::UpdateBooking {
        id,
        changes: BookingChanges {
            room_id: row.optional("room_id", as_u64)?,
            booking_date: row.optional("booking_date", as_date)?,
            span,
            purpose: row.text("purpose")?,
            description: row.text("description")?,
            expected_attendees: row.optional("expected_attendees", as_u32)?,
        },
        returning,
    })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(delete.selection.as_ref())?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom { id }),
        "room_availability" => Ok(Command::DeleteWindow { id }),
        // Bookings are never removed; deleting one cancels it.
        "bookings" => Ok(Command::CancelBooking {
            id,
            reason: None,
            returning: false,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let (limit, offset) = limit_offset(query)?;

    let cmd = match table.as_str() {
        "rooms" | "available_rooms" => {
            let id = filters.take_eq("id", as_u64)?;
            let mut filter = room_filter(&mut filters)?;
            if table == "available_rooms" {
                let date = filters.require_eq("booking_date", as_date)?;
                let span = filters.require_span()?;
                filter = filter
                    .with(RoomPredicate::AvailableOnly)
                    .with(RoomPredicate::FreeAt { date, span });
            }
            filter.limit = limit;
            filter.offset = offset;
            Command::SelectRooms { id, filter }
        }
        "room_availability" => Command::SelectWindows {
            room_id: filters.require_eq("room_id", as_u64)?,
        },
        "bookings" => {
            let mut filter = booking_filter(&mut filters)?;
            filter.limit = limit;
            filter.offset = offset;
            Command::SelectBookings { filter }
        }
        "visitors" => Command::SelectVisitors {
            id: filters.take_eq("id", as_u64)?,
        },
        "admins" => Command::SelectAdmins,
        "conflicts" => Command::SelectConflicts {
            room_id: filters.require_eq("room_id", as_u64)?,
            date: filters.require_eq("booking_date", as_date)?,
            span: filters.require_span()?,
            exclude: filters.take_eq("exclude_id", as_u64)?,
        },
        "availability" => Command::SelectSlot {
            room_id: filters.require_eq("room_id", as_u64)?,
            date: filters.require_eq("booking_date", as_date)?,
            span: filters.require_span()?,
        },
        "free_slots" => Command::SelectFreeSlots {
            room_id: filters.require_eq("room_id", as_u64)?,
            date: filters.require_eq("booking_date", as_date)?,
        },
        "stats" => Command::SelectStats,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    filters.finish(&table)?;
    Ok(cmd)
}

fn room_filter(filters: &mut Filters) -> Result<RoomFilter, SqlError> {
    let mut filter = RoomFilter::new();
    if let Some(t) = filters.take_eq("room_type", as_enum)? {
        filter = filter.with(RoomPredicate::Type(t));
    }
    if let Some(n) = filters.take(Op::GtEq, "capacity", as_u32)? {
        filter = filter.with(RoomPredicate::CapacityAtLeast(n));
    }
    if let Some(n) = filters.take(Op::LtEq, "capacity", as_u32)? {
        filter = filter.with(RoomPredicate::CapacityAtMost(n));
    }
    if filters.take_eq("is_available", as_bool)?.unwrap_or(false) {
        filter = filter.with(RoomPredicate::AvailableOnly);
    }
    if let Some(b) = filters.take_eq("building", as_required_text)? {
        filter = filter.with(RoomPredicate::Building(b));
    }
    if let Some(s) = filters.take_eq("search", as_required_text)? {
        filter = filter.with(RoomPredicate::Search(s));
    }
    Ok(filter)
}

fn booking_filter(filters: &mut Filters) -> Result<BookingFilter, SqlError> {
    let mut filter = BookingFilter::new();
    if let Some(id) = filters.take_eq("id", as_u64)? {
        filter = filter.with(BookingPredicate::Id(id));
    }
    if let Some(id) = filters.take_eq("room_id", as_u64)? {
        filter = filter.with(BookingPredicate::Room(id));
    }
    if let Some(id) = filters.take_eq("visitor_id", as_u64)? {
        filter = filter.with(BookingPredicate::Visitor(id));
    }
    if let Some(s) = filters.take_eq("status", as_enum)? {
        filter = filter.with(BookingPredicate::Status(s));
    }
    if let Some(d) = filters.take_eq("booking_date", as_date)? {
        filter = filter.with(BookingPredicate::Date(d));
    }
    if let Some(d) = filters.take(Op::GtEq, "booking_date", as_date)? {
        filter = filter.with(BookingPredicate::DateFrom(d));
    }
    if let Some(d) = filters.take(Op::LtEq, "booking_date", as_date)? {
        filter = filter.with(BookingPredicate::DateTo(d));
    }
    if let Some(r) = filters.take_eq("booking_reference", as_required_text)? {
        filter = filter.with(BookingPredicate::Reference(r));
    }
    Ok(filter)
}

fn limit_offset(query: &ast::Query) -> Result<(Option<usize>, usize), SqlError> {
    match &query.limit_clause {
        None => Ok((None, 0)),
        Some(LimitClause::LimitOffset { limit, offset, .. }) => {
            let limit = limit.as_ref().map(as_usize).transpose()?;
            let offset = offset.as_ref().map(|o| as_usize(&o.value)).transpose()?;
            Ok((limit, offset.unwrap_or(0)))
        }
        Some(LimitClause::OffsetCommaLimit { offset, limit }) => Ok((Some(as_usize(limit)?), as_usize(offset)?)),
    }
}

// ── WHERE ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    GtEq,
    LtEq,
}

/// Conjunction of `column op literal` comparisons. Each one must be consumed.
#[derive(Default)]
struct Filters {
    terms: Vec<(String, Op, Expr)>,
}

impl Filters {
    fn take<T>(
        &mut self,
        op: Op,
        column: &'static str,
        convert: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        match self.terms.iter().position(|(c, o, _)| c == column && *o == op) {
            Some(i) => {
                let (_, _, expr) = self.terms.remove(i);
                convert(&expr).map(Some)
            }
            None => Ok(None),
        }
    }

    fn take_eq<T>(
        &mut self,
        column: &'static str,
        convert: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        self.take(Op::Eq, column, convert)
    }

    fn require_eq<T>(
        &mut self,
        column: &'static str,
        convert: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<T, SqlError> {
        self.take_eq(column, convert)?.ok_or(SqlError::MissingFilter(column))
    }

    fn require_span(&mut self) -> Result<Span, SqlError> {
        Ok(Span {
            start: self.require_eq("start_time", as_time)?,
            end: self.require_eq("end_time", as_time)?,
        })
    }

    fn finish(self, table: &str) -> Result<(), SqlError> {
        match self.terms.into_iter().next() {
            Some((column, _, _)) => Err(SqlError::UnknownColumn {
                table: table.to_string(),
                column,
            }),
            None => Ok(()),
        }
    }
}

fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_filters(left, filters)?;
                    return collect_filters(right, filters);
                }
                ast::BinaryOperator::Eq => Op::Eq,
                ast::BinaryOperator::GtEq => Op::GtEq,
                ast::BinaryOperator::LtEq => Op::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("expected column on the left of {expr}")))?;
            filters.terms.push((column, op, (**right).clone()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn extract_where_id(selection: Option<&Expr>) -> Result<u64, SqlError> {
    let sel = selection.ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => as_u64(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

// ── Column/value rows ─────────────────────────────────────────

/// Named values from an INSERT row or UPDATE SET list. Every column must
/// be consumed, so typos surface as errors instead of being ignored.
struct Row {
    table: String,
    cells: HashMap<String, Expr>,
}

impl Row {
    fn from_insert(table: &str, insert: &ast::Insert) -> Result<Self, SqlError> {
        let body = insert
            .source
            .as_ref()
            .ok_or(SqlError::Parse("no VALUES".into()))?;
        let rows = match body.body.as_ref() {
            SetExpr::Values(values) => &values.rows,
            _ => return Err(SqlError::Parse("expected VALUES".into())),
        };
        let values = match rows.as_slice() {
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            [single] => single,
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        };
        if insert.columns.is_empty() {
            return Err(SqlError::Parse(format!("INSERT INTO {table} needs a column list")));
        }
        if insert.columns.len() != values.len() {
            return Err(SqlError::WrongArity(insert.columns.len(), values.len()));
        }
        let cells = insert
            .columns
            .iter()
            .map(|c| c.value.to_lowercase())
            .zip(values.iter().cloned())
            .collect();
        Ok(Self {
            table: table.to_string(),
            cells,
        })
    }

    fn from_assignments(table: &str, assignments: &[ast::Assignment]) -> Result<Self, SqlError> {
        let mut cells = HashMap::new();
        for a in assignments {
            let column = match &a.target {
                AssignmentTarget::ColumnName(name) => object_name_last(name),
                AssignmentTarget::Tuple(_) => None,
            }
            .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
            cells.insert(column, a.value.clone());
        }
        Ok(Self {
            table: table.to_string(),
            cells,
        })
    }

    fn optional<T>(
        &mut self,
        column: &'static str,
        convert: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        match self.cells.remove(column) {
            Some(expr) if is_null(&expr) => Ok(None),
            Some(expr) => convert(&expr).map(Some),
            None => Ok(None),
        }
    }

    fn required<T>(
        &mut self,
        column: &'static str,
        convert: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<T, SqlError> {
        self.optional(column, convert)?.ok_or(SqlError::MissingColumn(column))
    }

    fn text(&mut self, column: &'static str) -> Result<Option<String>, SqlError> {
        self.optional(column, as_required_text)
    }

    fn required_text(&mut self, column: &'static str) -> Result<String, SqlError> {
        self.required(column, as_required_text)
    }

    fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn finish(self) -> Result<(), SqlError> {
        match self.cells.into_keys().next() {
            Some(column) => Err(SqlError::UnknownColumn {
                table: self.table,
                column,
            }),
            None => Ok(()),
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Literal as text. Numbers and booleans are accepted too, since the extended
/// protocol binds every parameter as a quoted string.
fn literal_text(expr: &Expr) -> Result<String, SqlError> {
    match expr {
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(format!("-{}", literal_text(expr)?)),
        _ => match extract_value(expr) {
            Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
            Some(Value::Boolean(b)) => Ok(b.to_string()),
            Some(other) => Err(SqlError::Parse(format!("unexpected literal {other}"))),
            None => Err(SqlError::Parse(format!("expected literal, got {expr}"))),
        },
    }
}

fn as_required_text(expr: &Expr) -> Result<String, SqlError> {
    literal_text(expr)
}

fn as_u64(expr: &Expr) -> Result<u64, SqlError> {
    let s = literal_text(expr)?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("expected a positive integer, got {s}")))
}

fn as_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = as_u64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn as_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = as_u64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn as_usize(expr: &Expr) -> Result<usize, SqlError> {
    let v = as_u64(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn as_i32(expr: &Expr) -> Result<i32, SqlError> {
    let s = literal_text(expr)?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("expected an integer, got {s}")))
}

fn as_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    let s = literal_text(expr)?;
    Decimal::from_str(s.trim()).map_err(|_| SqlError::Parse(format!("expected a decimal, got {s}")))
}

fn as_bool(expr: &Expr) -> Result<bool, SqlError> {
    let s = literal_text(expr)?;
    match s.to_lowercase().as_str() {
        "true" | "t" | "1" => Ok(true),
        "false" | "f" | "0" => Ok(false),
        _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
    }
}

fn as_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| SqlError::Parse(format!("expected a YYYY-MM-DD date, got {s}")))
}

fn as_time(expr: &Expr) -> Result<Secs, SqlError> {
    let s = literal_text(expr)?;
    parse_time_of_day(&s).ok_or_else(|| SqlError::Parse(format!("expected HH:MM[:SS], got {s}")))
}

fn as_enum<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let s = literal_text(expr)?;
    s.parse().map_err(|e: T::Err| SqlError::Parse(e.to_string()))
}

/// `ARRAY['a', 'b']` or a comma-separated string.
fn as_text_list(expr: &Expr) -> Result<Vec<String>, SqlError> {
    if let Expr::Array(array) = expr {
        return array.elem.iter().map(literal_text).collect();
    }
    Ok(literal_text(expr)?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect())
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column {column} on {table}")]
    UnknownColumn { table: String, column: String },
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> Secs {
        parse_time_of_day(s).unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn parse_insert_room_with_defaults() {
        let sql = "INSERT INTO rooms (room_number, room_name, capacity, hourly_rate) \
                   VALUES ('A101', 'Seminar A', 20, 25.00)";
        match parse_sql(sql).unwrap() {
            Command::InsertRoom { room, returning } => {
                assert_eq!(room.room_number, "A101");
                assert_eq!(room.capacity, 20);
                assert_eq!(room.hourly_rate, Decimal::new(2500, 2));
                assert_eq!(room.room_type, RoomType::Classroom);
                assert!(room.is_available);
                assert!(room.requires_approval);
                assert!(room.amenities.is_empty());
                assert!(!returning);
            }
            other => panic!("expected InsertRoom, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_room_full() {
        let sql = "INSERT INTO rooms (room_number, room_name, capacity, hourly_rate, room_type, \
                   amenities, floor, requires_approval) \
                   VALUES ('L1', 'Lab', '60', '50.5', 'lab', ARRAY['fume hood', 'sink'], -1, false) RETURNING *";
        match parse_sql(sql).unwrap() {
            Command::InsertRoom { room, returning } => {
                assert_eq!(room.capacity, 60);
                assert_eq!(room.hourly_rate, Decimal::new(505, 1));
                assert_eq!(room.room_type, RoomType::Lab);
                assert_eq!(room.amenities, vec!["fume hood", "sink"]);
                assert_eq!(room.floor, Some(-1));
                assert!(!room.requires_approval);
                assert!(returning);
            }
            other => panic!("expected InsertRoom, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_unknown_column_errors() {
        let sql = "INSERT INTO rooms (room_number, room_name, capacity, colour) VALUES ('A', 'B', 1, 'red')";
        assert!(matches!(
            parse_sql(sql),
            Err(SqlError::UnknownColumn { column, .. }) if column == "colour"
        ));
    }

    #[test]
    fn parse_insert_missing_column_errors() {
        let sql = "INSERT INTO rooms (room_number, capacity) VALUES ('A', 1)";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingColumn("room_name"))));
    }

    #[test]
    fn parse_insert_booking() {
        let sql = "INSERT INTO bookings (room_id, booking_date, start_time, end_time, purpose, expected_attendees) \
                   VALUES (3, '2026-03-02', '09:00', '10:30', 'Study group', 4) RETURNING *";
        let cmd = parse_sql(sql).unwrap();
        assert_eq!(cmd.shape(), Shape::Bookings);
        match cmd {
            Command::InsertBooking { booking, returning } => {
                assert_eq!(booking.room_id, 3);
                assert_eq!(booking.booking_date, date("2026-03-02"));
                assert_eq!(booking.span, Span::new(t("09:00"), t("10:30")));
                assert_eq!(booking.expected_attendees, 4);
                assert_eq!(booking.description, None);
                assert!(returning);
            }
            other => panic!("expected InsertBooking, got {other:?}"),
        }
    }

    #[test]
    fn zero_length_span_reaches_the_engine() {
        let sql = "INSERT INTO bookings (room_id, booking_date, start_time, end_time, purpose) \
                   VALUES (3, '2026-03-02', '09:00', '09:00', 'x')";
        match parse_sql(sql).unwrap() {
            Command::InsertBooking { booking, .. } => {
                assert_eq!(booking.span.start, booking.span.end);
            }
            other => panic!("expected InsertBooking, got {other:?}"),
        }
    }

    #[test]
    fn parse_status_updates() {
        let approve = "UPDATE bookings SET status = 'approved', admin_notes = 'ok' WHERE id = 7";
        assert_eq!(
            parse_sql(approve).unwrap(),
            Command::ApproveBooking {
                id: 7,
                admin_notes: Some("ok".into()),
                returning: false
            }
        );

        let reject = "UPDATE bookings SET status = 'rejected', cancellation_reason = 'exams' WHERE id = 7 RETURNING *";
        assert_eq!(
            parse_sql(reject).unwrap(),
            Command::RejectBooking {
                id: 7,
                reason: Some("exams".into()),
                returning: true
            }
        );

        let cancel = "UPDATE bookings SET status = 'cancelled' WHERE id = 7";
        assert!(matches!(parse_sql(cancel).unwrap(), Command::CancelBooking { id: 7, reason: None, .. }));

        let completed = "UPDATE bookings SET status = 'completed' WHERE id = 7";
        assert!(matches!(parse_sql(completed), Err(SqlError::Unsupported(_))));

        let mixed = "UPDATE bookings SET status = 'approved', purpose = 'x' WHERE id = 7";
        assert!(matches!(parse_sql(mixed), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_booking_edit() {
        let sql = "UPDATE bookings SET room_id = 4, start_time = '13:00', end_time = '14:00' WHERE id = 9";
        match parse_sql(sql).unwrap() {
            Command::UpdateBooking { id, changes, .. } => {
                assert_eq!(id, 9);
                assert_eq!(changes.room_id, Some(4));
                assert_eq!(changes.span, Some(Span::new(t("13:00"), t("14:00"))));
                assert_eq!(changes.booking_date, None);
            }
            other => panic!("expected UpdateBooking, got {other:?}"),
        }

        let half = "UPDATE bookings SET start_time = '13:00' WHERE id = 9";
        assert!(matches!(parse_sql(half), Err(SqlError::MissingColumn(_))));
    }

    #[test]
    fn delete_booking_cancels() {
        assert_eq!(
            parse_sql("DELETE FROM bookings WHERE id = 12").unwrap(),
            Command::CancelBooking {
                id: 12,
                reason: None,
                returning: false
            }
        );
        assert!(matches!(
            parse_sql("DELETE FROM bookings"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_update_room_and_visitor() {
        match parse_sql("UPDATE rooms SET hourly_rate = 40.00, is_available = false WHERE id = 1").unwrap() {
            Command::UpdateRoom { id, changes, .. } => {
                assert_eq!(id, 1);
                assert_eq!(changes.hourly_rate, Some(Decimal::new(4000, 2)));
                assert_eq!(changes.is_available, Some(false));
                assert!(!changes.touches_fixed_fields());
            }
            other => panic!("expected UpdateRoom, got {other:?}"),
        }
        match parse_sql("UPDATE visitors SET is_active = 'f' WHERE id = 2").unwrap() {
            Command::UpdateVisitor { id, changes, .. } => {
                assert_eq!(id, 2);
                assert_eq!(changes.is_active, Some(false));
                assert_eq!(changes.first_name, None);
            }
            other => panic!("expected UpdateVisitor, got {other:?}"),
        }
    }

    #[test]
    fn parse_select_bookings_with_filters() {
        let sql = "SELECT * FROM bookings WHERE room_id = 1 AND status = 'approved' \
                   AND booking_date >= '2026-03-01' AND booking_date <= '2026-03-31' LIMIT 10 OFFSET 5";
        match parse_sql(sql).unwrap() {
            Command::SelectBookings { filter } => {
                assert_eq!(
                    filter.predicates,
                    vec![
                        BookingPredicate::Room(1),
                        BookingPredicate::Status(BookingStatus::Approved),
                        BookingPredicate::DateFrom(date("2026-03-01")),
                        BookingPredicate::DateTo(date("2026-03-31")),
                    ]
                );
                assert_eq!(filter.limit, Some(10));
                assert_eq!(filter.offset, 5);
            }
            other => panic!("expected SelectBookings, got {other:?}"),
        }
    }

    #[test]
    fn parse_select_unknown_filter_errors() {
        let sql = "SELECT * FROM bookings WHERE colour = 'red'";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownColumn { .. })));
        let sql = "SELECT * FROM bookings WHERE id = 1 OR id = 2";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_available_rooms() {
        let sql = "SELECT * FROM available_rooms WHERE booking_date = '2026-03-02' \
                   AND start_time = '09:00' AND end_time = '10:00' AND capacity >= 30";
        match parse_sql(sql).unwrap() {
            Command::SelectRooms { id, filter } => {
                assert_eq!(id, None);
                assert_eq!(
                    filter.predicates,
                    vec![
                        RoomPredicate::CapacityAtLeast(30),
                        RoomPredicate::AvailableOnly,
                        RoomPredicate::FreeAt {
                            date: date("2026-03-02"),
                            span: Span::new(t("09:00"), t("10:00")),
                        },
                    ]
                );
            }
            other => panic!("expected SelectRooms, got {other:?}"),
        }
    }

    #[test]
    fn parse_resolver_views() {
        let sql = "SELECT * FROM conflicts WHERE room_id = 1 AND booking_date = '2026-03-02' \
                   AND start_time = '09:59' AND end_time = '10:30' AND exclude_id = 4";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectConflicts {
                room_id: 1,
                date: date("2026-03-02"),
                span: Span::new(t("09:59"), t("10:30")),
                exclude: Some(4),
            }
        );

        let sql = "SELECT * FROM free_slots WHERE room_id = 1 AND booking_date = '2026-03-02'";
        assert!(matches!(parse_sql(sql).unwrap(), Command::SelectFreeSlots { room_id: 1, .. }));

        let sql = "SELECT * FROM availability WHERE room_id = 1 AND booking_date = '2026-03-02'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("start_time"))));
    }

    #[test]
    fn parse_payment_event() {
        let sql = r#"INSERT INTO payment_events (payload, signature) VALUES ('{"type":"x"}', 't=1,v1=ab')"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertPaymentEvent {
                payload: r#"{"type":"x"}"#.into(),
                signature: "t=1,v1=ab".into(),
            }
        );
    }

    #[test]
    fn statement_shape_handles_placeholders() {
        assert_eq!(statement_shape("SELECT * FROM bookings WHERE id = $1"), Shape::Bookings);
        assert_eq!(statement_shape("SELECT * FROM stats"), Shape::Stats);
        assert_eq!(
            statement_shape("INSERT INTO checkouts (room_id) VALUES ($1)"),
            Shape::Checkout
        );
        assert_eq!(
            statement_shape("INSERT INTO bookings (room_id) VALUES ($1)"),
            Shape::Empty
        );
        assert_eq!(
            statement_shape("UPDATE bookings SET status = $1 WHERE id = $2 RETURNING *"),
            Shape::Bookings
        );
        assert_eq!(statement_shape("not sql"), Shape::Empty);
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql("SELECT * FROM resources"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
