/// Complaint submission and admin triage

mod common;

use common::{TestComplaintBuilder, TestContext};
use study_companion::error::{ClientError, Result};
use study_companion::models::{
    ComplaintFilter, ComplaintPriority, ComplaintStatus, NewComplaint, RecordId,
};
use study_companion::remote::{DataService, Operation, Table};
use study_companion::services::submit_complaint;

#[tokio::test]
async fn test_urgent_complaint_reply_flow() -> Result<()> {
    let ctx = TestContext::new();
    let staff = ctx.user("Staff", "staff@uni.edu").await?;
    let console = ctx.admin_console(&staff, &["staff@uni.edu"]);

    let complaint = submit_complaint(
        &ctx.backend,
        NewComplaint::new("student@uni.edu", "Cannot join group", "The chat never loads")
            .with_priority(ComplaintPriority::Urgent)
            .with_phone("555-0100"),
    )
    .await?;

    let stats = console.load_stats().await?;
    assert_eq!(stats.total, 1);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.urgent_pending, 1);
    assert_eq!(stats.resolved, 0);
    assert_eq!(stats.users, 1);

    console.load_complaints(ComplaintFilter::Pending).await?;
    let resolved = console.reply(complaint.id, "Fixed, please retry.").await?;

    assert!(resolved.is_resolved());
    assert_eq!(resolved.admin_reply.as_deref(), Some("Fixed, please retry."));
    assert_eq!(resolved.replied_by.as_deref(), Some("staff@uni.edu"));
    assert!(resolved.replied_at.is_some());
    assert_eq!(resolved.phone.as_deref(), Some("555-0100"));

    // Refreshed with the filter that was active.
    assert_eq!(console.filter().await, ComplaintFilter::Pending);
    assert!(console.complaints().await.is_empty());
    let stats = console.stats().await;
    assert_eq!((stats.pending, stats.resolved, stats.urgent_pending), (0, 1, 0));

    let listed = console.load_complaints(ComplaintFilter::Resolved).await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, complaint.id);
    Ok(())
}

#[tokio::test]
async fn test_reply_to_closed_or_unknown_complaint() -> Result<()> {
    let ctx = TestContext::new();
    let staff = ctx.user("Staff", "staff@uni.edu").await?;
    let console = ctx.admin_console(&staff, &["staff@uni.edu"]);

    let complaint =
        submit_complaint(&ctx.backend, NewComplaint::new("a@uni.edu", "Login", "Broken")).await?;
    console.reply(complaint.id, "Done").await?;

    let err = console.reply(complaint.id, "Again").await.unwrap_err();
    assert!(matches!(err, ClientError::AlreadyResolved(_)));

    let err = console.reply(RecordId::new(), "Hello?").await.unwrap_err();
    assert!(matches!(err, ClientError::NotFound(_)));

    // The first reply is kept.
    let listed = console.load_complaints(ComplaintFilter::All).await?;
    assert_eq!(listed[0].admin_reply.as_deref(), Some("Done"));
    Ok(())
}

#[tokio::test]
async fn test_listing_is_newest_first_and_filtered() -> Result<()> {
    let ctx = TestContext::new();
    let staff = ctx.user("Staff", "staff@uni.edu").await?;
    let console = ctx.admin_console(&staff, &["staff@uni.edu"]);

    let rows = vec![
        TestComplaintBuilder::new().subject("oldest").minutes_ago(30).build(),
        TestComplaintBuilder::new()
            .subject("middle")
            .status(ComplaintStatus::Resolved)
            .minutes_ago(20)
            .build(),
        TestComplaintBuilder::new().subject("newest").minutes_ago(10).build(),
    ];
    ctx.backend.insert(Table::Complaints, rows).await?;

    let all = console.load_complaints(ComplaintFilter::All).await?;
    let subjects: Vec<&str> = all.iter().map(|c| c.subject.as_str()).collect();
    assert_eq!(subjects, vec!["newest", "middle", "oldest"]);

    let pending = console.load_complaints(ComplaintFilter::Pending).await?;
    let subjects: Vec<&str> = pending.iter().map(|c| c.subject.as_str()).collect();
    assert_eq!(subjects, vec!["newest", "oldest"]);

    let resolved = console.load_complaints(ComplaintFilter::Resolved).await?;
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].subject, "middle");
    Ok(())
}

#[tokio::test]
async fn test_loads_degrade_to_empty() -> Result<()> {
    let ctx = TestContext::new();
    let staff = ctx.user("Staff", "staff@uni.edu").await?;
    let console = ctx.admin_console(&staff, &["staff@uni.edu"]);
    ctx.backend
        .insert(Table::Complaints, vec![TestComplaintBuilder::new().build()])
        .await?;

    ctx.backend.fail_next(Operation::Select, Some(Table::Complaints));
    assert!(console.load_complaints(ComplaintFilter::All).await?.is_empty());

    ctx.backend.fail_next(Operation::Select, Some(Table::Complaints));
    let stats = console.load_stats().await?;
    assert_eq!(stats.total, 0);
    assert_eq!(stats.users, 0);

    assert_eq!(console.load_complaints(ComplaintFilter::All).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_non_admin_cannot_triage() -> Result<()> {
    let ctx = TestContext::new();
    let student = ctx.user("Student", "student@uni.edu").await?;
    let console = ctx.admin_console(&student, &["staff@uni.edu"]);

    let complaint =
        submit_complaint(&ctx.backend, NewComplaint::new("a@uni.edu", "Login", "Broken")).await?;

    assert!(!console.is_admin());
    assert!(matches!(console.load_stats().await, Err(ClientError::NotAdmin)));
    let err = console.reply(complaint.id, "Not mine to answer").await.unwrap_err();
    assert!(matches!(err, ClientError::NotAdmin));

    let stored = ctx.backend.rows(Table::Complaints);
    assert_eq!(stored[0]["status"], "pending");
    Ok(())
}

#[tokio::test]
async fn test_signed_out_admin_is_not_authenticated() -> Result<()> {
    let ctx = TestContext::new();
    let staff = ctx.user("Staff", "staff@uni.edu").await?;
    let console = ctx.admin_console(&staff, &["staff@uni.edu"]);

    staff.session.logout().await?;
    assert!(matches!(
        console.load_complaints(ComplaintFilter::All).await,
        Err(ClientError::NotAuthenticated)
    ));
    Ok(())
}
