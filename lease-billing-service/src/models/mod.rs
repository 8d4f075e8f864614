//! Domain models for lease-billing-service.

mod charge;
mod credit_note;
mod invoice;
mod invoice_run;
mod lease;
mod payment;
mod utility;

pub use charge::{
    codes, ChargeFrequency, ChargeType, LeaseRecurringCharge, NewChargeType, NewRecurringCharge,
    RecordState,
};
pub use credit_note::{
    CreateCreditNote, CreditNote, CreditNoteLine, CreditNoteLineInput, CreditNoteStatus,
};
pub use invoice::{DraftInvoiceWrite, Invoice, InvoiceLine, InvoiceStatus, LineSource};
pub use invoice_run::{InvoiceRun, InvoiceRunItem, InvoiceRunKind, InvoiceRunStatus, RunResult};
pub use lease::{
    Lease, LeaseBillingSetting, LeaseStatus, LeaseTerm, ProrationMethod, UpsertBillingSetting,
};
pub use payment::{
    ConfirmationRequestStatus, Payment, PaymentConfirmationRequest, PaymentMode, PaymentPosting,
    PaymentStatus, PaymentStatusHistory, RecordPayment, SubmitConfirmationRequest,
};
pub use utility::{
    NewRatePlan, NewRateSlab, RecordStatement, StatementBasis, UtilityRatePlan, UtilityRateSlab,
    UtilityStatement, UtilityType,
};
