//! Withdrawal and transfer certificate integration tests.

mod common;

use common::{date, dec, spawn_ledger, YEAR};
use fee_ledger_service::models::{ArrearDirection, FeeCategory, IssueCertificate};
use rust_decimal::Decimal;
use service_core::error::AppError;

fn request(admission_number: &str, force: bool) -> IssueCertificate {
    IssueCertificate {
        admission_number: admission_number.to_string(),
        academic_year: YEAR.to_string(),
        issued_on: date(2025, 3, 31),
        force,
    }
}

#[tokio::test]
async fn settled_student_gets_a_certificate_without_arrears() {
    let t = spawn_ledger().await;
    t.admit("A100").await;
    t.assign("A100", FeeCategory::Tuition, "Tuition", "1000").await;
    t.pay("In0001", "A100", "Tuition", "1000", "0").await;

    let issued = t
        .ledger
        .issue_certificate(&t.tenant, &request("A100", false))
        .await
        .unwrap();
    assert!(issued.arrears.is_empty());
    assert_eq!(issued.certificate.fee_balance_shifted, dec("0"));

    t.cleanup().await;
}

#[tokio::test]
async fn outstanding_balance_blocks_unless_forced() {
    let t = spawn_ledger().await;
    t.admit("A100").await;
    t.assign("A100", FeeCategory::Tuition, "Tuition", "10000").await;
    t.assign("A100", FeeCategory::Transport, "Bus Fee", "3000").await;
    t.pay("In0001", "A100", "Tuition", "9000", "0").await;
    t.pay("In0002", "A100", "Bus Fee", "2500", "0").await;

    let err = t
        .ledger
        .issue_certificate(&t.tenant, &request("A100", false))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let issued = t
        .ledger
        .issue_certificate(&t.tenant, &request("A100", true))
        .await
        .unwrap();

    assert_eq!(issued.certificate.fee_balance_shifted, dec("1500.00"));
    assert_eq!(issued.arrears.len(), 2);
    let shifted: Decimal = issued.arrears.iter().map(|a| a.amount).sum();
    assert_eq!(shifted, issued.certificate.fee_balance_shifted);
    assert!(issued
        .arrears
        .iter()
        .all(|a| a.parsed_direction() == Some(ArrearDirection::Out)
            && a.certificate_id == Some(issued.certificate.certificate_id)));

    let result = t.ledger.reconcile(&t.tenant, "A100", &t.year).await.unwrap();
    assert_eq!(result.arrears.shifted_out, dec("1500"));

    let err = t
        .ledger
        .issue_certificate(&t.tenant, &request("A100", true))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    t.cleanup().await;
}

#[tokio::test]
async fn sub_threshold_residue_is_not_shifted() {
    let t = spawn_ledger().await;
    t.admit("A100").await;
    t.assign("A100", FeeCategory::Tuition, "Tuition", "1000").await;
    t.assign("A100", FeeCategory::Individual, "Library Fine", "0.40").await;
    t.pay("In0001", "A100", "Tuition", "400", "0").await;

    let issued = t
        .ledger
        .issue_certificate(&t.tenant, &request("A100", true))
        .await
        .unwrap();
    assert_eq!(issued.arrears.len(), 1);
    assert_eq!(issued.arrears[0].fee_head, "Tuition");
    assert_eq!(issued.certificate.fee_balance_shifted, dec("600"));

    t.cleanup().await;
}

#[tokio::test]
async fn unknown_student_cannot_be_withdrawn() {
    let t = spawn_ledger().await;

    let err = t
        .ledger
        .issue_certificate(&t.tenant, &request("Z999", true))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    t.cleanup().await;
}

#[tokio::test]
async fn duplicate_admission_number_is_a_conflict() {
    let t = spawn_ledger().await;
    t.admit("A100").await;

    let err = t
        .students
        .register(
            &t.tenant,
            &fee_ledger_service::models::Student {
                admission_number: "A100".to_string(),
                full_name: "Someone Else".to_string(),
                standard: "II".to_string(),
                section: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    t.cleanup().await;
}
