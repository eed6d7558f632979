use rust_decimal::Decimal;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_span;
use super::mutations::{check_optional_text, require_admin};
use super::{Engine, EngineError};

impl Engine {
    // ── Rooms ────────────────────────────────────────────────

    pub async fn create_room(&self, principal: &Principal, new: NewRoom) -> Result<Room, EngineError> {
        require_admin(principal)?;
        if self.store.room_count() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        validate_room_fields(
            &new.room_number,
            &new.room_name,
            new.description.as_deref(),
            new.capacity,
            new.hourly_rate,
            &new.amenities,
        )?;

        let _commit = self.begin_write().await?;
        let now = self.clock.now();
        let id = self.store.next_room_id();
        self.store.claim_room_number(&new.room_number, id)?;
        let room = Room {
            id,
            room_number: new.room_number,
            room_name: new.room_name,
            description: new.description,
            capacity: new.capacity,
            location: new.location,
            building: new.building,
            floor: new.floor,
            room_type: new.room_type,
            amenities: new.amenities,
            hourly_rate: new.hourly_rate,
            is_available: new.is_available,
            requires_approval: new.requires_approval,
            created_at: now,
            updated_at: now,
        };

        let event = Event::RoomCreated { room: room.clone() };
        if let Err(e) = self.persist_global(&event).await {
            self.store.release_room_number(&room.room_number);
            return Err(e);
        }
        tracing::info!(room_id = id, room_number = %room.room_number, "room created");
        Ok(room)
    }

    /// Edit a room. Once bookings reference it, only the hourly rate and the
    /// availability flag may change; stored booking costs are untouched.
    pub async fn update_room(
        &self,
        principal: &Principal,
        id: RoomId,
        changes: RoomChanges,
    ) -> Result<Room, EngineError> {
        require_admin(principal)?;
        let _commit = self.begin_write().await?;
        let mut guard = self.lock_room(id).await?;
        if changes.is_empty() {
            return Ok(guard.room.clone());
        }
        if guard.has_bookings() && changes.touches_fixed_fields() {
            return Err(EngineError::RoomInUse(id));
        }

        let mut room = guard.room.clone();
        if let Some(v) = changes.room_number {
            room.room_number = v;
        }
        if let Some(v) = changes.room_name {
            room.room_name = v;
        }
        if let Some(v) = changes.description {
            room.description = Some(v);
        }
        if let Some(v) = changes.capacity {
            room.capacity = v;
        }
        if let Some(v) = changes.location {
            room.location = Some(v);
        }
        if let Some(v) = changes.building {
            room.building = Some(v);
        }
        if let Some(v) = changes.floor {
            room.floor = Some(v);
        }
        if let Some(v) = changes.room_type {
            room.room_type = v;
        }
        if let Some(v) = changes.amenities {
            room.amenities = v;
        }
        if let Some(v) = changes.hourly_rate {
            room.hourly_rate = v;
        }
        if let Some(v) = changes.is_available {
            room.is_available = v;
        }
        if let Some(v) = changes.requires_approval {
            room.requires_approval = v;
        }
        validate_room_fields(
            &room.room_number,
            &room.room_name,
            room.description.as_deref(),
            room.capacity,
            room.hourly_rate,
            &room.amenities,
        )?;
        room.updated_at = self.clock.now();

        let renumbered = room.room_number != guard.room.room_number;
        if renumbered {
            self.store.claim_room_number(&room.room_number, id)?;
        }
        let event = Event::RoomUpdated { room: room.clone() };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            if renumbered {
                self.store.release_room_number(&room.room_number);
            }
            return Err(e);
        }
        tracing::info!(room_id = id, "room updated");
        Ok(room)
    }

    /// Delete a room. Refused while any booking, live or not, references it.
    pub async fn delete_room(&self, principal: &Principal, id: RoomId) -> Result<(), EngineError> {
        require_admin(principal)?;
        let _commit = self.begin_write().await?;
        let guard = self.lock_room(id).await?;
        if guard.has_bookings() {
            return Err(EngineError::RoomInUse(id));
        }
        if self.checkouts.iter().any(|c| c.value().room_id == id) {
            return Err(EngineError::RoomInUse(id));
        }

        let event = Event::RoomDeleted { id };
        self.wal_append(&event).await?;
        self.store.remove_room(&guard);
        tracing::info!(room_id = id, "room deleted");
        Ok(())
    }

    // ── Availability windows ─────────────────────────────────

    pub async fn add_availability(
        &self,
        principal: &Principal,
        new: NewWindow,
    ) -> Result<AvailabilityWindow, EngineError> {
        require_admin(principal)?;
        validate_span(&new.span)?;
        if new.day_of_week > 6 {
            return Err(EngineError::invalid("day_of_week must be between 0 (Sunday) and 6"));
        }

        let _commit = self.begin_write().await?;
        let mut guard = self.lock_room(new.room_id).await?;
        if guard.windows.len() >= MAX_WINDOWS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many availability windows on room"));
        }
        if guard
            .windows
            .iter()
            .any(|w| w.day_of_week == new.day_of_week && w.span == new.span)
        {
            return Err(EngineError::Duplicate {
                field: "availability window",
                value: format!("day {} {}", new.day_of_week, new.span),
            });
        }

        let window = AvailabilityWindow {
            id: self.store.next_window_id(),
            room_id: new.room_id,
            day_of_week: new.day_of_week,
            span: new.span,
            is_available: new.is_available,
        };
        let event = Event::WindowAdded {
            window: window.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(window)
    }

    pub async fn remove_availability(&self, principal: &Principal, id: WindowId) -> Result<RoomId, EngineError> {
        require_admin(principal)?;
        let _commit = self.begin_write().await?;
        let room_id = self
            .store
            .room_for_window(id)
            .ok_or_else(|| EngineError::not_found("availability window", id))?;
        let mut guard = self.lock_room(room_id).await?;
        if !guard.windows.iter().any(|w| w.id == id) {
            return Err(EngineError::not_found("availability window", id));
        }
        let event = Event::WindowRemoved { id, room_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(room_id)
    }

    // ── Visitors ─────────────────────────────────────────────

    /// Self-registration. The password hash comes from the external auth layer.
    pub async fn register_visitor(&self, new: NewVisitor) -> Result<VisitorView, EngineError> {
        validate_email(&new.email)?;
        validate_name(&new.first_name, "first_name")?;
        validate_name(&new.last_name, "last_name")?;
        if new.password_hash.is_empty() {
            return Err(EngineError::invalid("password hash is required"));
        }
        if new.student_id.as_deref().is_some_and(|s| s.trim().is_empty() || s.len() > MAX_NAME_LEN) {
            return Err(EngineError::invalid("student_id must be 1-100 characters"));
        }
        check_optional_text(new.phone.as_deref(), MAX_NAME_LEN, "phone too long")?;
        check_optional_text(new.department.as_deref(), MAX_NAME_LEN, "department too long")?;

        let _commit = self.begin_write().await?;
        let now = self.clock.now();
        let id = self.store.next_visitor_id();
        self.store
            .claim_visitor_keys(&new.email, new.student_id.as_deref(), id)?;
        let visitor = Visitor {
            id,
            student_id: new.student_id,
            email: new.email.trim().to_string(),
            password_hash: new.password_hash,
            first_name: new.first_name,
            last_name: new.last_name,
            phone: new.phone,
            user_type: new.user_type,
            department: new.department,
            is_active: true,
            email_verified: false,
            created_at: now,
            updated_at: now,
        };

        let event = Event::VisitorRegistered {
            visitor: visitor.clone(),
        };
        if let Err(e) = self.persist_global(&event).await {
            self.store
                .release_visitor_keys(&visitor.email, visitor.student_id.as_deref());
            return Err(e);
        }
        tracing::info!(visitor_id = id, "visitor registered");
        Ok(VisitorView::from(&visitor))
    }

    /// Profile edit by the visitor themself. `is_active` is ignored here.
    pub async fn update_visitor_profile(
        &self,
        principal: &Principal,
        id: VisitorId,
        changes: VisitorChanges,
    ) -> Result<VisitorView, EngineError> {
        if principal.visitor_id() != Some(id) {
            return Err(EngineError::Forbidden("visitors may only edit their own profile"));
        }
        if let Some(n) = &changes.first_name {
            validate_name(n, "first_name")?;
        }
        if let Some(n) = &changes.last_name {
            validate_name(n, "last_name")?;
        }
        check_optional_text(changes.phone.as_deref(), MAX_NAME_LEN, "phone too long")?;
        check_optional_text(changes.department.as_deref(), MAX_NAME_LEN, "department too long")?;

        let _commit = self.begin_write().await?;
        let _accounts = self.accounts.lock().await;
        let mut visitor = self
            .store
            .visitor(id)
            .ok_or_else(|| EngineError::not_found("visitor", id))?;
        if let Some(v) = changes.first_name {
            visitor.first_name = v;
        }
        if let Some(v) = changes.last_name {
            visitor.last_name = v;
        }
        if changes.phone.is_some() {
            visitor.phone = changes.phone;
        }
        if changes.department.is_some() {
            visitor.department = changes.department;
        }
        self.save_visitor(visitor).await
    }

    pub async fn set_visitor_active(
        &self,
        principal: &Principal,
        id: VisitorId,
        active: bool,
    ) -> Result<VisitorView, EngineError> {
        require_admin(principal)?;
        let _commit = self.begin_write().await?;
        let _accounts = self.accounts.lock().await;
        let mut visitor = self
            .store
            .visitor(id)
            .ok_or_else(|| EngineError::not_found("visitor", id))?;
        visitor.is_active = active;
        let view = self.save_visitor(visitor).await?;
        tracing::info!(visitor_id = id, active, "visitor activation changed");
        Ok(view)
    }

    async fn save_visitor(&self, mut visitor: Visitor) -> Result<VisitorView, EngineError> {
        visitor.updated_at = self.clock.now();
        let event = Event::VisitorUpdated {
            visitor: visitor.clone(),
        };
        self.persist_global(&event).await?;
        Ok(VisitorView::from(&visitor))
    }

    // ── Admins ───────────────────────────────────────────────

    /// Register an admin. Only super admins may do this, except that the very
    /// first admin may be created by anyone to bootstrap an empty store.
    pub async fn register_admin(&self, principal: &Principal, new: NewAdmin) -> Result<AdminView, EngineError> {
        let _commit = self.begin_write().await?;
        let _accounts = self.accounts.lock().await;
        let bootstrap = self.store.admins().is_empty();
        if !bootstrap
            && !matches!(
                principal,
                Principal::Admin {
                    role: AdminRole::SuperAdmin,
                    ..
                }
            )
        {
            return Err(EngineError::Forbidden("super admin access required"));
        }
        validate_name(&new.username, "username")?;
        validate_email(&new.email)?;
        validate_name(&new.first_name, "first_name")?;
        validate_name(&new.last_name, "last_name")?;
        if new.password_hash.is_empty() {
            return Err(EngineError::invalid("password hash is required"));
        }

        let id = self.store.next_admin_id();
        self.store.claim_admin_keys(&new.username, &new.email, id)?;
        let admin = Admin {
            id,
            username: new.username,
            email: new.email.trim().to_string(),
            password_hash: new.password_hash,
            first_name: new.first_name,
            last_name: new.last_name,
            role: if bootstrap { AdminRole::SuperAdmin } else { new.role },
            is_active: true,
            created_at: self.clock.now(),
        };

        let event = Event::AdminRegistered { admin: admin.clone() };
        if let Err(e) = self.persist_global(&event).await {
            self.store.release_admin_keys(&admin.username, &admin.email);
            return Err(e);
        }
        tracing::info!(admin_id = id, role = %admin.role, "admin registered");
        Ok(AdminView::from(&admin))
    }
}

fn validate_room_fields(
    room_number: &str,
    room_name: &str,
    description: Option<&str>,
    capacity: u32,
    hourly_rate: Decimal,
    amenities: &[String],
) -> Result<(), EngineError> {
    if room_number.trim().is_empty() || room_number.len() > MAX_ROOM_NUMBER_LEN {
        return Err(EngineError::invalid("room_number must be 1-20 characters"));
    }
    validate_name(room_name, "room_name")?;
    check_optional_text(description, MAX_TEXT_LEN, "description too long")?;
    if capacity == 0 || capacity > MAX_CAPACITY {
        return Err(EngineError::invalid("capacity must be between 1 and 10000"));
    }
    if hourly_rate < Decimal::ZERO {
        return Err(EngineError::invalid("hourly_rate cannot be negative"));
    }
    if amenities.len() > MAX_AMENITIES {
        return Err(EngineError::LimitExceeded("too many amenities"));
    }
    Ok(())
}

fn validate_name(value: &str, field: &'static str) -> Result<(), EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation(format!("{field} is required")));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(EngineError::Validation(format!("{field} too long")));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), EngineError> {
    let email = email.trim();
    let valid = email.len() <= MAX_EMAIL_LEN
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.') && !domain.starts_with('.'));
    if !valid {
        return Err(EngineError::Validation(format!("invalid email: {email}")));
    }
    Ok(())
}
