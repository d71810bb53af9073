use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use uuid::Uuid;

use docarchive::{
    archive::{self, DocumentStatus, DocumentType, Priority},
    auth::{password::hash_password, Role},
    config::AppConfig,
    db,
    models::{NewCategory, NewDocument, NewUser},
    schema::{categories, documents, users},
};

struct SeedUser {
    username: &'static str,
    email: &'static str,
    password: &'static str,
    full_name: &'static str,
    role: Role,
}

const USERS: [SeedUser; 3] = [
    SeedUser {
        username: "admin",
        email: "admin@archive.local",
        password: "admin123",
        full_name: "System Administrator",
        role: Role::Admin,
    },
    SeedUser {
        username: "dataentry",
        email: "dataentry@archive.local",
        password: "data123",
        full_name: "Data Entry Clerk",
        role: Role::DataEntry,
    },
    SeedUser {
        username: "archivist",
        email: "archivist@archive.local",
        password: "archive123",
        full_name: "Archivist",
        role: Role::Archivist,
    },
];

struct SeedDocument {
    title: &'static str,
    doc_type: DocumentType,
    category: &'static str,
    issue_date: (i32, u32, u32),
    counterpart: &'static str,
    subject: &'static str,
    description: &'static str,
    priority: Priority,
    archived_on: Option<(i32, u32, u32)>,
}

const DOCUMENTS: [SeedDocument; 5] = [
    SeedDocument {
        title: "Annual leave request",
        doc_type: DocumentType::Incoming,
        category: "Administrative Affairs",
        issue_date: (2024, 1, 15),
        counterpart: "Human Resources",
        subject: "Two weeks of annual leave",
        description: "Please approve the annual leave request",
        priority: Priority::Medium,
        archived_on: None,
    },
    SeedDocument {
        title: "Reply to leave request",
        doc_type: DocumentType::Outgoing,
        category: "Administrative Affairs",
        issue_date: (2024, 1, 16),
        counterpart: "Human Resources",
        subject: "Leave request approved",
        description: "The annual leave request has been approved",
        priority: Priority::Medium,
        archived_on: None,
    },
    SeedDocument {
        title: "Office equipment invoice",
        doc_type: DocumentType::Incoming,
        category: "Financial Affairs",
        issue_date: (2024, 2, 1),
        counterpart: "Office Supplies Co.",
        subject: "Invoice 12345",
        description: "Invoice for office equipment purchases",
        priority: Priority::High,
        archived_on: None,
    },
    SeedDocument {
        title: "Computer maintenance contract",
        doc_type: DocumentType::Incoming,
        category: "Technical Affairs",
        issue_date: (2024, 3, 1),
        counterpart: "Advanced Technologies Ltd.",
        subject: "Annual maintenance contract",
        description: "Yearly maintenance for workstations and servers",
        priority: Priority::Urgent,
        archived_on: None,
    },
    SeedDocument {
        title: "Safety procedures circular",
        doc_type: DocumentType::Outgoing,
        category: "Administrative Affairs",
        issue_date: (2024, 1, 10),
        counterpart: "All departments",
        subject: "Occupational health and safety",
        description: "Safety procedures to follow in the workplace",
        priority: Priority::High,
        archived_on: Some((2024, 6, 1)),
    },
];

const CATEGORIES: [(&str, &str); 4] = [
    ("Administrative Affairs", "Administrative correspondence"),
    ("Financial Affairs", "Financial correspondence"),
    ("Technical Affairs", "Technical correspondence"),
    ("Legal Affairs", "Legal correspondence"),
];

const SUBCATEGORIES: [(&str, &str, &str); 4] = [
    ("Recruitment", "Hiring and appointments", "Administrative Affairs"),
    ("Leave", "Leave and holidays", "Administrative Affairs"),
    ("Budget", "Annual budget", "Financial Affairs"),
    ("Procurement", "Purchases and contracts", "Financial Affairs"),
];

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config = AppConfig::from_env()?;
    println!("Seeding {}", config.redacted_database_url());

    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    db::run_migrations(&pool)?;
    let mut conn = pool.get().context("failed to get database connection")?;

    conn.transaction::<_, anyhow::Error, _>(|conn| {
        println!("Clearing existing data…");
        conn.batch_execute(
            "TRUNCATE TABLE notifications, document_notes, document_files, documents, categories, refresh_tokens, users CASCADE;",
        )
        .context("failed to clear tables")?;

        let user_ids = seed_users(conn)?;
        let admin = user_ids[0];
        let data_entry = user_ids[1];
        let archivist = user_ids[2];

        let category_ids = seed_categories(conn, admin)?;
        seed_documents(conn, &category_ids, data_entry, archivist)?;
        Ok(())
    })?;

    println!("\nLogin credentials:");
    for user in &USERS {
        println!("  {:<10} {:<10} {}", user.role.as_str(), user.username, user.password);
    }
    Ok(())
}

fn seed_users(conn: &mut PgConnection) -> Result<Vec<Uuid>> {
    println!("Creating users…");
    let mut ids = Vec::with_capacity(USERS.len());
    for user in &USERS {
        let row = NewUser {
            id: Uuid::new_v4(),
            username: user.username.to_string(),
            email: user.email.to_string(),
            password_hash: hash_password(user.password)?,
            full_name: user.full_name.to_string(),
            role: user.role.as_str().to_string(),
            is_active: true,
        };
        diesel::insert_into(users::table)
            .values(&row)
            .execute(conn)
            .with_context(|| format!("failed to insert user {}", user.username))?;
        ids.push(row.id);
    }
    Ok(ids)
}

fn seed_categories(conn: &mut PgConnection, admin: Uuid) -> Result<Vec<(&'static str, Uuid)>> {
    println!("Creating categories…");
    let mut ids = Vec::new();
    for (name, description) in CATEGORIES {
        let id = insert_category(conn, name, description, None, admin)?;
        ids.push((name, id));
    }
    for (name, description, parent) in SUBCATEGORIES {
        let parent_id = lookup(&ids, parent)?;
        insert_category(conn, name, description, Some(parent_id), admin)?;
    }
    Ok(ids)
}

fn insert_category(
    conn: &mut PgConnection,
    name: &str,
    description: &str,
    parent_id: Option<Uuid>,
    created_by: Uuid,
) -> Result<Uuid> {
    let row = NewCategory {
        id: Uuid::new_v4(),
        name: name.to_string(),
        description: Some(description.to_string()),
        parent_id,
        is_active: true,
        created_by,
    };
    diesel::insert_into(categories::table)
        .values(&row)
        .execute(conn)
        .with_context(|| format!("failed to insert category {name}"))?;
    Ok(row.id)
}

fn seed_documents(
    conn: &mut PgConnection,
    category_ids: &[(&'static str, Uuid)],
    created_by: Uuid,
    archivist: Uuid,
) -> Result<()> {
    println!("Creating sample documents…");
    for doc in &DOCUMENTS {
        let issue_date = date(doc.issue_date)?;
        let document_number = archive::next_document_number(conn, doc.doc_type, issue_date)?;
        let (sender, recipient) = match doc.doc_type {
            DocumentType::Incoming => (Some(doc.counterpart.to_string()), None),
            DocumentType::Outgoing => (None, Some(doc.counterpart.to_string())),
        };
        let (status, archive_date, archived_by) = match doc.archived_on {
            Some(day) => (DocumentStatus::Archived, Some(date(day)?), Some(archivist)),
            None => (DocumentStatus::Active, None, None),
        };

        let row = NewDocument {
            id: Uuid::new_v4(),
            document_number,
            title: doc.title.to_string(),
            doc_type: doc.doc_type.as_str().to_string(),
            category_id: lookup(category_ids, doc.category)?,
            subcategory_id: None,
            issue_date,
            sender,
            recipient,
            subject: Some(doc.subject.to_string()),
            description: Some(doc.description.to_string()),
            priority: doc.priority.as_str().to_string(),
            status: status.as_str().to_string(),
            tags: Vec::new(),
            archive_date,
            archive_reminder_date: None,
            archived_by,
            created_by,
        };
        diesel::insert_into(documents::table)
            .values(&row)
            .execute(conn)
            .with_context(|| format!("failed to insert document {}", doc.title))?;
        println!("  {} {}", row.document_number, row.title);
    }
    Ok(())
}

fn lookup(ids: &[(&'static str, Uuid)], name: &str) -> Result<Uuid> {
    ids.iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, id)| *id)
        .with_context(|| format!("unknown category {name}"))
}

fn date((year, month, day): (i32, u32, u32)) -> Result<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .with_context(|| format!("invalid date {year}-{month}-{day}"))
}
