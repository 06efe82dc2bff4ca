use std::fmt::Debug;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type, METADATA_USER};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::auth::{Actor, TourdeskAuthSource};
use crate::engine::{CatalogKind, Engine, EngineError, ProposalDraft};
use crate::model::*;
use crate::notify::Notification;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, NOTIFY_CHANNEL};

/// One handler per connection; it owns the session's LISTEN subscription.
pub struct TourdeskHandler {
    engine: Arc<Engine>,
    query_parser: Arc<TourdeskQueryParser>,
    listener: Mutex<Option<broadcast::Receiver<Notification>>>,
}

impl TourdeskHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(TourdeskQueryParser),
            listener: Mutex::new(None),
        }
    }

    fn actor<C: ClientInfo>(client: &C) -> Actor {
        client
            .metadata()
            .get(METADATA_USER)
            .map_or(Actor::Tourist(None), |user| Actor::from_login(user))
    }

    fn set_listener(&self, rx: Option<broadcast::Receiver<Notification>>) {
        let mut guard = self.listener.lock().unwrap_or_else(|p| p.into_inner());
        *guard = rx;
    }

    fn take_notifications(&self) -> Vec<String> {
        let mut guard = self.listener.lock().unwrap_or_else(|p| p.into_inner());
        let Some(rx) = guard.as_mut() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(notification) => out.push(notification.payload()),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "listener fell behind, notifications dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        out
    }

    /// Deliver whatever arrived for this session since the last command.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for payload in self.take_notifications() {
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    0,
                    NOTIFY_CHANNEL.to_string(),
                    payload,
                )))
                .await?;
        }
        Ok(())
    }

    async fn run(&self, actor: &Actor, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, actor: &Actor, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let engine = &self.engine;
        let columns = result_columns(&cmd);
        match cmd {
            Command::CreateBooking(request) => {
                engine.create_booking(actor, request).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(actor, id, None).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::DecideBooking { booking_id, accept } => {
                engine.decide_booking(actor, booking_id, accept).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::AssignGuide { booking_id, guide_id } => {
                engine.assign_guide(actor, booking_id, guide_id).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::ConfirmPayment { booking_id, reference } => {
                engine.confirm_payment(actor, booking_id, reference).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::CompleteBooking { booking_id } => {
                engine.complete_booking(actor, booking_id).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::RecordRefund { booking_id } => {
                engine.record_refund(actor, booking_id).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::SubmitProposal { id, body } => {
                let draft = ProposalDraft::from_json(&body).map_err(engine_err)?;
                engine.submit_proposal(actor, id, draft).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::ReviewProposal { proposal_id, approve, notes } => {
                if approve {
                    engine.approve_proposal(actor, proposal_id, notes).await.map_err(engine_err)?;
                } else {
                    engine.reject_proposal(actor, proposal_id, notes).await.map_err(engine_err)?;
                }
                Ok(inserted())
            }
            Command::AddBusyMarker { id, guide_id, start_date, end_date, note } => {
                engine
                    .add_busy_marker(actor, id, guide_id, start_date, end_date, note)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::RemoveBusyMarker { id } => {
                engine.remove_busy_marker(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::RegisterCatalogEntry { kind, id, name } => {
                engine.register_catalog_entry(actor, kind, id, name).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::RemoveCatalogEntry { kind, id } => {
                engine.remove_catalog_entry(actor, kind, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectCapacity { tour_id, date } => {
                let info = engine.capacity(tour_id, date).await.map_err(engine_err)?;
                Ok(rows(columns, format, vec![info], |e, c| {
                    e.encode_field(&c.tour_id.to_string())?;
                    e.encode_field(&c.date.to_string())?;
                    e.encode_field(&(c.effective_cap as i64))?;
                    e.encode_field(&(c.consumed as i64))?;
                    e.encode_field(&(c.remaining as i64))
                }))
            }
            Command::SelectBookings(filter) => {
                let bookings = engine.bookings(actor, filter).await.map_err(engine_err)?;
                Ok(rows(columns, format, bookings, encode_booking))
            }
            Command::SelectProposals { status } => {
                let proposals = engine.proposals(actor, status).await.map_err(engine_err)?;
                Ok(rows(columns, format, proposals, encode_proposal))
            }
            Command::SelectTours => Ok(rows(columns, format, engine.tours(), |e, t| encode_tour(e, t))),
            Command::SelectCheckout { booking_id } => {
                let session = engine.checkout(actor, booking_id).await.map_err(engine_err)?;
                Ok(rows(columns, format, vec![session], |e, s| {
                    e.encode_field(&booking_id.to_string())?;
                    e.encode_field(&s.url)?;
                    e.encode_field(&s.reference)
                }))
            }
            Command::SelectBusyMarkers { guide_id } => {
                let markers = engine.busy_markers(actor, guide_id).map_err(engine_err)?;
                Ok(rows(columns, format, markers, |e, m| {
                    e.encode_field(&m.id.to_string())?;
                    e.encode_field(&m.guide_id.to_string())?;
                    e.encode_field(&m.start_date.to_string())?;
                    e.encode_field(&m.end_date.to_string())?;
                    e.encode_field(&m.note)
                }))
            }
            Command::SelectCatalog(kind) => {
                let entries = match kind {
                    CatalogKind::Location => engine.locations().await,
                    CatalogKind::Category => engine.categories().await,
                };
                Ok(rows(columns, format, entries, |e, (id, name)| {
                    e.encode_field(&id.to_string())?;
                    e.encode_field(name)
                }))
            }
            Command::Listen { .. } => {
                let user = actor
                    .id()
                    .ok_or_else(|| engine_err(EngineError::Forbidden("anonymous sessions cannot LISTEN")))?;
                self.set_listener(Some(engine.notify.subscribe(user)));
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { .. } => {
                self.set_listener(None);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

// ── Result sets ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Kind {
    Text,
    Int,
    Bool,
}

impl Kind {
    fn pg_type(self) -> Type {
        match self {
            Kind::Text => Type::VARCHAR,
            Kind::Int => Type::INT8,
            Kind::Bool => Type::BOOL,
        }
    }
}

type Columns = &'static [(&'static str, Kind)];

const CAPACITY_COLUMNS: Columns = &[
    ("tour_id", Kind::Text),
    ("date", Kind::Text),
    ("capacity", Kind::Int),
    ("consumed", Kind::Int),
    ("remaining", Kind::Int),
];

const BOOKING_COLUMNS: Columns = &[
    ("id", Kind::Text),
    ("tour_id", Kind::Text),
    ("customer_id", Kind::Text),
    ("start_date", Kind::Text),
    ("start_time", Kind::Text),
    ("adults", Kind::Int),
    ("children", Kind::Int),
    ("guide_id", Kind::Text),
    ("status", Kind::Text),
    ("amount", Kind::Int),
    ("payment_ref", Kind::Text),
    ("refund", Kind::Text),
    ("full_name", Kind::Text),
    ("email", Kind::Text),
    ("phone", Kind::Text),
    ("note", Kind::Text),
    ("created_at", Kind::Int),
    ("updated_at", Kind::Int),
];

const PROPOSAL_COLUMNS: Columns = &[
    ("id", Kind::Text),
    ("author_id", Kind::Text),
    ("status", Kind::Text),
    ("name", Kind::Text),
    ("resubmission_of", Kind::Text),
    ("submitted_at", Kind::Int),
    ("reviewer_id", Kind::Text),
    ("reviewed_at", Kind::Int),
    ("notes", Kind::Text),
    ("tour_id", Kind::Text),
];

const TOUR_COLUMNS: Columns = &[
    ("id", Kind::Text),
    ("slug", Kind::Text),
    ("name", Kind::Text),
    ("description", Kind::Text),
    ("category_id", Kind::Text),
    ("location_ids", Kind::Text),
    ("duration_minutes", Kind::Int),
    ("price", Kind::Int),
    ("child_price", Kind::Int),
    ("capacity", Kind::Int),
    ("allow_custom_date", Kind::Bool),
    ("departure_dates", Kind::Text),
    ("start_time", Kind::Text),
    ("main_guide_id", Kind::Text),
    ("guide_ids", Kind::Text),
    ("proposal_id", Kind::Text),
    ("created_at", Kind::Int),
];

const CHECKOUT_COLUMNS: Columns = &[
    ("booking_id", Kind::Text),
    ("url", Kind::Text),
    ("reference", Kind::Text),
];

const MARKER_COLUMNS: Columns = &[
    ("id", Kind::Text),
    ("guide_id", Kind::Text),
    ("start_date", Kind::Text),
    ("end_date", Kind::Text),
    ("note", Kind::Text),
];

const CATALOG_COLUMNS: Columns = &[("id", Kind::Text), ("name", Kind::Text)];

fn result_columns(cmd: &Command) -> Columns {
    match cmd {
        Command::SelectCapacity { .. } => CAPACITY_COLUMNS,
        Command::SelectBookings(_) => BOOKING_COLUMNS,
        Command::SelectProposals { .. } => PROPOSAL_COLUMNS,
        Command::SelectTours => TOUR_COLUMNS,
        Command::SelectCheckout { .. } => CHECKOUT_COLUMNS,
        Command::SelectBusyMarkers { .. } => MARKER_COLUMNS,
        Command::SelectCatalog(_) => CATALOG_COLUMNS,
        _ => &[],
    }
}

/// Columns for a statement before it is bound; only the table matters.
fn statement_columns(sql: &str) -> Columns {
    let lower = sql.trim_start().to_lowercase();
    if !lower.starts_with("select") {
        return &[];
    }
    let table = lower.split_once(" from ").and_then(|(_, rest)| {
        rest.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .find(|s| !s.is_empty())
    });
    match table {
        Some("capacity") => CAPACITY_COLUMNS,
        Some("bookings") => BOOKING_COLUMNS,
        Some("proposals") => PROPOSAL_COLUMNS,
        Some("tours") => TOUR_COLUMNS,
        Some("checkout") => CHECKOUT_COLUMNS,
        Some("busy_markers") => MARKER_COLUMNS,
        Some("locations" | "categories") => CATALOG_COLUMNS,
        _ => &[],
    }
}

fn schema(columns: Columns, format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, kind))| FieldInfo::new(name.to_string(), None, None, kind.pg_type(), format.format_for(i)))
        .collect()
}

fn rows<T>(
    columns: Columns,
    format: &Format,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema(columns, format));
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

fn opt_id(id: Option<ulid::Ulid>) -> Option<String> {
    id.map(|id| id.to_string())
}

fn joined<T: ToString>(items: impl IntoIterator<Item = T>) -> String {
    items.into_iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",")
}

fn encode_booking(e: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    e.encode_field(&b.id.to_string())?;
    e.encode_field(&b.tour_id.to_string())?;
    e.encode_field(&opt_id(b.customer_id))?;
    e.encode_field(&b.start_date.to_string())?;
    e.encode_field(&b.start_time.format("%H:%M").to_string())?;
    e.encode_field(&(b.adults as i64))?;
    e.encode_field(&(b.children as i64))?;
    e.encode_field(&opt_id(b.guide_id))?;
    e.encode_field(&b.status.to_string())?;
    e.encode_field(&(b.amount as i64))?;
    e.encode_field(&b.payment_ref)?;
    e.encode_field(&b.refund.as_str().to_string())?;
    e.encode_field(&b.contact.full_name)?;
    e.encode_field(&b.contact.email)?;
    e.encode_field(&b.contact.phone)?;
    e.encode_field(&b.contact.note)?;
    e.encode_field(&b.created_at)?;
    e.encode_field(&b.updated_at)
}

fn encode_proposal(e: &mut DataRowEncoder, p: &Proposal) -> PgWireResult<()> {
    let review = p.review.as_ref();
    e.encode_field(&p.id.to_string())?;
    e.encode_field(&p.author_id.to_string())?;
    e.encode_field(&p.status.as_str().to_string())?;
    e.encode_field(&p.definition.name)?;
    e.encode_field(&opt_id(p.resubmission_of))?;
    e.encode_field(&p.submitted_at)?;
    e.encode_field(&opt_id(review.map(|r| r.reviewer_id)))?;
    e.encode_field(&review.map(|r| r.reviewed_at))?;
    e.encode_field(&review.and_then(|r| r.notes.clone()))?;
    e.encode_field(&opt_id(review.and_then(|r| r.tour_id)))
}

fn encode_tour(e: &mut DataRowEncoder, t: &Tour) -> PgWireResult<()> {
    let d = &t.definition;
    let main_guide = d.guides.iter().find(|g| g.is_main).map(|g| g.guide_id);
    e.encode_field(&t.id.to_string())?;
    e.encode_field(&t.slug)?;
    e.encode_field(&d.name)?;
    e.encode_field(&d.description)?;
    e.encode_field(&opt_id(d.category_id))?;
    e.encode_field(&joined(&d.location_ids))?;
    e.encode_field(&(d.duration_minutes as i64))?;
    e.encode_field(&(d.price as i64))?;
    e.encode_field(&(d.child_price as i64))?;
    e.encode_field(&(d.effective_cap() as i64))?;
    e.encode_field(&d.policy.allow_custom_date)?;
    e.encode_field(&joined(&d.policy.departure_dates))?;
    e.encode_field(&d.start_time().format("%H:%M").to_string())?;
    e.encode_field(&opt_id(main_guide))?;
    e.encode_field(&joined(d.guides.iter().map(|g| g.guide_id)))?;
    e.encode_field(&opt_id(t.proposal_id))?;
    e.encode_field(&t.created_at)
}

#[async_trait]
impl SimpleQueryHandler for TourdeskHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = Self::actor(client);
        let result = self.run(&actor, query, &Format::UnifiedText).await;
        self.flush_notifications(client).await?;
        Ok(vec![result?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TourdeskQueryParser;

#[async_trait]
impl QueryParser for TourdeskQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        let format = column_format.unwrap_or(&Format::UnifiedText);
        Ok(schema(statement_columns(stmt), format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TourdeskHandler {
    type Statement = String;
    type QueryParser = TourdeskQueryParser;

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
        let actor = Self::actor(client);
        let sql = substitute_params(portal);
        let result = self.run(&actor, &sql, &portal.result_column_format).await;
        self.flush_notifications(client).await?;
        result
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
        let fields = schema(statement_columns(&target.statement), &Format::UnifiedText);
        Ok(DescribeStatementResponse::new(param_types, fields))
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
        let columns = statement_columns(&target.statement.statement);
        Ok(DescribePortalResponse::new(schema(columns, &target.result_column_format)))
    }
}

/// Byte ranges and indexes of `$N` placeholders outside quoted literals
/// and quoted identifiers.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            // A doubled quote closes and reopens, which comes out the same.
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' => {
                quote = Some(b);
                i += 1;
            }
            b'$' => {
                let start = i;
                i += 1;
                let digits = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[digits..i].parse::<usize>()
                    && n > 0
                {
                    out.push((start, i, n));
                }
            }
            _ => i += 1,
        }
    }
    out
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|&(_, _, n)| n).max().unwrap_or(0)
}

/// Splice bound values (text format) into the statement in one left to
/// right pass. Inserted values are never rescanned. Placeholders without a
/// bound value are left for the parser to reject.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = params.get(n - 1) else {
            continue;
        };
        out.push_str(&sql[copied..start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TourdeskFactory {
    handler: Arc<TourdeskHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<TourdeskAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl TourdeskFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = TourdeskAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TourdeskHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TourdeskFactory {
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
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(TourdeskFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn engine_err(e: EngineError) -> PgWireError {
    let body = e.body();
    let (code, message) = if e.is_internal() {
        tracing::error!(code = e.code(), "internal error: {e}");
        ("XX000", body.message.clone())
    } else {
        ("P0001", format!("{}: {}", body.code, body.message))
    };
    let mut info = ErrorInfo::new("ERROR".into(), code.into(), message);
    info.detail = serde_json::to_string(&body).ok();
    PgWireError::UserError(Box::new(info))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM tours"), 0);
        assert_eq!(count_params("INSERT INTO completions VALUES ($1)"), 1);
        assert_eq!(count_params("SELECT * FROM capacity WHERE tour_id = $2 AND date = $1"), 2);
        assert_eq!(count_params("SELECT $$x$$"), 0);
        assert_eq!(count_params("SELECT * FROM bookings WHERE id = '$7'"), 0);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "INSERT INTO proposals (id, body) VALUES ($1, $2)";
        let bound = bind_params(sql, &[Some("01J"), Some("{\"name\": \"Walk from $1 at O'Hare\"}")]);
        assert_eq!(
            bound,
            "INSERT INTO proposals (id, body) VALUES ('01J', '{\"name\": \"Walk from $1 at O''Hare\"}')"
        );
    }

    #[test]
    fn placeholders_inside_literals_and_unbound_ones_stay() {
        let bound = bind_params("SELECT * FROM bookings WHERE id = '$1' AND tour_id = $1 OR x = $3", &[Some("a"), None::<&str>]);
        assert_eq!(bound, "SELECT * FROM bookings WHERE id = '$1' AND tour_id = 'a' OR x = $3");
        assert_eq!(bind_params("VALUES ($2, $10)", &[None, None::<&str>]), "VALUES (NULL, $10)");
    }

    #[test]
    fn statement_columns_follow_table() {
        assert_eq!(statement_columns("select * FROM bookings WHERE id = $1").len(), BOOKING_COLUMNS.len());
        assert_eq!(statement_columns("SELECT * FROM locations").len(), 2);
        assert!(statement_columns("INSERT INTO bookings VALUES ($1)").is_empty());
    }

    #[test]
    fn domain_error_carries_code_and_detail() {
        let err = engine_err(EngineError::InsufficientSlots { remaining: 1, requested: 3 });
        let PgWireError::UserError(info) = err else { panic!("expected user error") };
        assert_eq!(info.code, "P0001");
        assert!(info.message.starts_with("INSUFFICIENT_SLOTS: "));
        let detail: serde_json::Value = serde_json::from_str(info.detail.as_deref().unwrap()).unwrap();
        assert_eq!(detail["code"], "INSUFFICIENT_SLOTS");
        assert_eq!(detail["meta"]["remaining"], 1);
    }

    #[test]
    fn internal_error_is_opaque() {
        let err = engine_err(EngineError::WalError("disk full at /var/lib".into()));
        let PgWireError::UserError(info) = err else { panic!("expected user error") };
        assert_eq!(info.code, "XX000");
        assert_eq!(info.message, "internal server error");
        assert!(!info.detail.unwrap_or_default().contains("disk"));
    }

    #[tokio::test]
    async fn listener_drains_pending_notifications() {
        let dir = std::env::temp_dir().join("tourdesk_test_wire");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("listener.wal");
        let _ = std::fs::remove_file(&path);
        let engine = Arc::new(
            Engine::new(
                path,
                Arc::new(crate::notify::NotifyHub::new()),
                Arc::new(crate::gateway::HostedCheckout::new("https://pay.test")),
            )
            .unwrap(),
        );
        let handler = TourdeskHandler::new(engine.clone());
        let user = Ulid::new();
        assert!(handler.take_notifications().is_empty());

        handler.set_listener(Some(engine.notify.subscribe(user)));
        let booking_id = Ulid::new();
        engine.notify.send(user, Notification::RefundIssued { booking_id, amount: 900 });
        engine.notify.send(Ulid::new(), Notification::RefundIssued { booking_id, amount: 1 });

        let payloads = handler.take_notifications();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains("refund_issued"));
        assert!(handler.take_notifications().is_empty());

        handler.set_listener(None);
        engine.notify.send(user, Notification::RefundIssued { booking_id, amount: 900 });
        assert!(handler.take_notifications().is_empty());
    }
}
