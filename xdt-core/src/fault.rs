//! Simulated packet loss.
//!
//! The service can be started with one error case from the table below; the
//! injector sits in front of the UDP send primitive, decodes each outgoing
//! PDU and swallows the ones the case selects, reporting them as sent.
//!
//! ```text
//! case        dropped                        simulation goal
//! ---------   ----------------------------   -------------------------
//! Dat1    1   DT with sequence 1             failing connect
//! Dat2    2   DT with sequence 2             Go-Back-N recovery
//! Dat4Once 3  first DT with sequence 4       Go-Back-N recovery
//! Dat3Up  4   every DT with sequence > 2     connection abort
//! Ack1    5   ACK with sequence 1            failing connect
//! Ack3Once 6  first ACK with sequence 3      no direct impact
//! Ack4Up  7   every ACK with sequence > 3    connection abort
//! Abo     8   ACKs > 3 and every ABO         connection abort
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

use crate::pdu::Pdu;

/// The selectable error cases; `None` leaves transmission untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive)]
pub enum ErrorCase {
    #[default]
    None = 0,
    Dat1 = 1,
    Dat2 = 2,
    Dat4Once = 3,
    Dat3Up = 4,
    Ack1 = 5,
    Ack3Once = 6,
    Ack4Up = 7,
    Abo = 8,
}

impl ErrorCase {
    /// The CLI number of the case, or `None` when out of range.
    pub fn from_number(number: u8) -> Option<Self> {
        Self::from_u8(number)
    }
}

/// Decides the fate of each outgoing PDU. Shared by every instance of one
/// service process so the fire-once cases latch process-wide.
#[derive(Debug, Default)]
pub struct FaultInjector {
    case: ErrorCase,
    dat4_fired: AtomicBool,
    ack3_fired: AtomicBool,
}

impl FaultInjector {
    pub fn new(case: ErrorCase) -> Self {
        Self {
            case,
            ..Self::default()
        }
    }

    /// True if this PDU must be silently dropped instead of transmitted.
    pub fn absorbs(&self, pdu: &Pdu) -> bool {
        match (self.case, pdu) {
            (ErrorCase::None, _) => false,

            (ErrorCase::Dat1, Pdu::Dt(dt)) => dt.sequ == 1,
            (ErrorCase::Dat2, Pdu::Dt(dt)) => dt.sequ == 2,
            (ErrorCase::Dat4Once, Pdu::Dt(dt)) => {
                dt.sequ == 4 && !self.dat4_fired.swap(true, Ordering::SeqCst)
            }
            (ErrorCase::Dat3Up, Pdu::Dt(dt)) => dt.sequ > 2,

            (ErrorCase::Ack1, Pdu::Ack(ack)) => ack.sequ == 1,
            (ErrorCase::Ack3Once, Pdu::Ack(ack)) => {
                ack.sequ == 3 && !self.ack3_fired.swap(true, Ordering::SeqCst)
            }
            (ErrorCase::Ack4Up, Pdu::Ack(ack)) => ack.sequ > 3,

            (ErrorCase::Abo, Pdu::Ack(ack)) => ack.sequ > 3,
            (ErrorCase::Abo, Pdu::Abo(_)) => true,

            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pdu::{Abo, Ack, Dt, DtLink};

    fn dt(sequ: u32) -> Pdu {
        Pdu::Dt(Dt {
            sequ,
            link: DtLink::Conn(1),
            eom: false,
            data: vec![],
        })
    }

    fn ack(sequ: u32) -> Pdu {
        Pdu::Ack(Ack {
            sequ,
            endpoints: None,
            conn: 1,
        })
    }

    #[test]
    fn case_numbers_map_to_cases() {
        assert_eq!(ErrorCase::from_number(0), Some(ErrorCase::None));
        assert_eq!(ErrorCase::from_number(3), Some(ErrorCase::Dat4Once));
        assert_eq!(ErrorCase::from_number(8), Some(ErrorCase::Abo));
        assert_eq!(ErrorCase::from_number(9), None);
    }

    #[test]
    fn none_absorbs_nothing() {
        let injector = FaultInjector::new(ErrorCase::None);
        assert!(!injector.absorbs(&dt(1)));
        assert!(!injector.absorbs(&ack(1)));
        assert!(!injector.absorbs(&Pdu::Abo(Abo { conn: 1 })));
    }

    #[test]
    fn sequence_predicates_select_exactly() {
        let injector = FaultInjector::new(ErrorCase::Dat2);
        assert!(!injector.absorbs(&dt(1)));
        assert!(injector.absorbs(&dt(2)));
        assert!(!injector.absorbs(&dt(3)));
        assert!(!injector.absorbs(&ack(2)));

        let injector = FaultInjector::new(ErrorCase::Dat3Up);
        assert!(!injector.absorbs(&dt(2)));
        assert!(injector.absorbs(&dt(3)));
        assert!(injector.absorbs(&dt(9)));
    }

    #[test]
    fn fire_once_cases_latch() {
        let injector = FaultInjector::new(ErrorCase::Dat4Once);
        assert!(injector.absorbs(&dt(4)));
        assert!(!injector.absorbs(&dt(4)));

        let injector = FaultInjector::new(ErrorCase::Ack3Once);
        assert!(injector.absorbs(&ack(3)));
        assert!(!injector.absorbs(&ack(3)));
    }

    #[test]
    fn abo_case_covers_late_acks_and_aborts() {
        let injector = FaultInjector::new(ErrorCase::Abo);
        assert!(!injector.absorbs(&ack(3)));
        assert!(injector.absorbs(&ack(4)));
        assert!(injector.absorbs(&Pdu::Abo(Abo { conn: 1 })));
        assert!(!injector.absorbs(&dt(4)));
    }
}
