//! Register access layer for the DWC OTG controller and the system timer
//!
//! The register blocks follow the RAL conventions: a `#[repr(C)]` block of
//! `RWRegister`s, and one module per register holding a module per field,
//! each with an `offset`, a `mask`, and the (empty) `R`, `W` and `RW`
//! enumerated-value modules that the `ral-registers` macros expect.

#![allow(non_snake_case, non_upper_case_globals, dead_code)]

pub use ral_registers::{modify_reg, read_reg, write_reg, RWRegister};

/// Defines the field modules of one or more registers.
macro_rules! fields {
    ($($reg:ident { $($field:ident: $offset:expr, $width:expr;)* })*) => {
        $(
            pub mod $reg {
                $(
                    pub mod $field {
                        pub const offset: u32 = $offset;
                        pub const mask: u32 = ((((1u64 << $width) - 1) as u32) << offset);
                        pub mod R {}
                        pub mod W {}
                        pub mod RW {}
                    }
                )*
            }
        )*
    };
}

/// The DWC OTG core, host and channel registers.
pub mod otg {
    use super::RWRegister;
    use crate::CHANNEL_COUNT;

    /// Host channel register block, repeated every 0x20 bytes from 0x500
    #[repr(C)]
    pub struct HostChannel {
        pub HCCHAR: RWRegister<u32>,
        pub HCSPLT: RWRegister<u32>,
        pub HCINT: RWRegister<u32>,
        pub HCINTMSK: RWRegister<u32>,
        pub HCTSIZ: RWRegister<u32>,
        pub HCDMA: RWRegister<u32>,
        _reserved: [u32; 2],
    }

    /// A channel's data FIFO window
    ///
    /// Every word in the 4 KiB window aliases the same FIFO port, so we only
    /// name the first one.
    #[repr(C)]
    pub struct Fifo {
        pub DATA: RWRegister<u32>,
        _reserved: [u32; 0x3FF],
    }

    #[repr(C)]
    pub struct RegisterBlock {
        pub GOTGCTL: RWRegister<u32>,
        pub GOTGINT: RWRegister<u32>,
        pub GAHBCFG: RWRegister<u32>,
        pub GUSBCFG: RWRegister<u32>,
        pub GRSTCTL: RWRegister<u32>,
        pub GINTSTS: RWRegister<u32>,
        pub GINTMSK: RWRegister<u32>,
        pub GRXSTSR: RWRegister<u32>,
        pub GRXSTSP: RWRegister<u32>,
        pub GRXFSIZ: RWRegister<u32>,
        pub GNPTXFSIZ: RWRegister<u32>,
        pub GNPTXSTS: RWRegister<u32>,
        _reserved0: [u32; 0x34],
        pub HPTXFSIZ: RWRegister<u32>,
        _reserved1: [u32; 0xBF],
        pub HCFG: RWRegister<u32>,
        pub HFIR: RWRegister<u32>,
        pub HFNUM: RWRegister<u32>,
        _reserved2: u32,
        pub HPTXSTS: RWRegister<u32>,
        pub HAINT: RWRegister<u32>,
        pub HAINTMSK: RWRegister<u32>,
        _reserved3: [u32; 9],
        pub HPRT: RWRegister<u32>,
        _reserved4: [u32; 0x2F],
        pub HC: [HostChannel; CHANNEL_COUNT],
        _reserved5: [u32; 0x280],
        pub FIFO: [Fifo; CHANNEL_COUNT],
    }

    fields! {
        GAHBCFG {
            GLBLINTRMSK: 0, 1;
            DMAEN: 5, 1;
        }
        GUSBCFG {
            FORCEHSTMODE: 29, 1;
        }
        GRSTCTL {
            CSFTRST: 0, 1;
            RXFFLSH: 4, 1;
            TXFFLSH: 5, 1;
            TXFNUM: 6, 5;
            AHBIDL: 31, 1;
        }
        GINTSTS {
            RXFLVL: 4, 1;
            NPTXFE: 5, 1;
            PRTINT: 24, 1;
            HCHINT: 25, 1;
            PTXFE: 26, 1;
        }
        GINTMSK {
            RXFLVL: 4, 1;
            NPTXFE: 5, 1;
            PRTINT: 24, 1;
            HCHINT: 25, 1;
            PTXFE: 26, 1;
        }
        GRXSTSP {
            CHNUM: 0, 4;
            BCNT: 4, 11;
            DPID: 15, 2;
            PKTSTS: 17, 4;
        }
        GRXFSIZ {
            RXFDEP: 0, 16;
        }
        GNPTXFSIZ {
            NPTXFSTADDR: 0, 16;
            NPTXFDEP: 16, 16;
        }
        GNPTXSTS {
            NPTXFSAVAIL: 0, 16;
        }
        HPTXFSIZ {
            PTXFSTADDR: 0, 16;
            PTXFSIZE: 16, 16;
        }
        HCFG {
            FSLSPCLKSEL: 0, 2;
        }
        HFNUM {
            FRNUM: 0, 16;
        }
        HPTXSTS {
            PTXFSAVAIL: 0, 16;
        }
        HPRT {
            PRTCONNSTS: 0, 1;
            PRTENA: 2, 1;
            PRTCONNDET: 3, 1;
            PRTOVRCURRCHNG: 5, 1;
            PRTRST: 8, 1;
            PRTPWR: 12, 1;
            PRTSPD: 16, 2;
        }
        HCCHAR {
            MPS: 0, 11;
            EPNUM: 11, 4;
            EPDIR: 15, 1;
            EPTYPE: 18, 2;
            DEVADDR: 22, 7;
            CHDIS: 30, 1;
            CHENA: 31, 1;
        }
        HCTSIZ {
            XFERSIZE: 0, 19;
            PKTCNT: 19, 10;
            PID: 29, 2;
        }
    }

    /// PKTSTS value for "IN data packet received"
    pub const PKTSTS_IN_DATA: u32 = 0b0010;

    /// HPRT bits that clear when written with one.
    ///
    /// Writing PRTENA back as one disables the port, so read-modify-write
    /// cycles mask these out.
    pub const HPRT_W1C: u32 = HPRT::PRTENA::mask | HPRT::PRTCONNDET::mask | HPRT::PRTOVRCURRCHNG::mask;

    const _: [(); 1] = [(); (core::mem::size_of::<HostChannel>() == 0x20) as usize];
    const _: [(); 1] = [(); (core::mem::size_of::<Fifo>() == 0x1000) as usize];
    const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x9000) as usize];
}

/// The BCM2837 free-running system timer
pub mod systimer {
    use super::RWRegister;

    #[repr(C)]
    pub struct RegisterBlock {
        pub CS: RWRegister<u32>,
        pub CLO: RWRegister<u32>,
        pub CHI: RWRegister<u32>,
        pub C0: RWRegister<u32>,
        pub C1: RWRegister<u32>,
        pub C2: RWRegister<u32>,
        pub C3: RWRegister<u32>,
    }
}

#[cfg(test)]
mod test {
    use super::{otg, read_reg, write_reg};
    use core::mem::MaybeUninit;

    fn channel() -> otg::HostChannel {
        // Safety: registers are plain cells; zero is a valid bit pattern.
        unsafe { MaybeUninit::zeroed().assume_init() }
    }

    #[test]
    fn hcchar_fields() {
        let hc = channel();
        write_reg!(otg, &hc, HCCHAR, MPS: 64, EPNUM: 1, EPDIR: 1, EPTYPE: 2, DEVADDR: 5);
        assert_eq!(
            hc.HCCHAR.read(),
            64 | (1 << 11) | (1 << 15) | (2 << 18) | (5 << 22)
        );
        assert_eq!(read_reg!(otg, &hc, HCCHAR, DEVADDR), 5);
    }

    #[test]
    fn hctsiz_fields_truncate() {
        let hc = channel();
        write_reg!(otg, &hc, HCTSIZ, XFERSIZE: u32::MAX, PKTCNT: 1, PID: 0);
        assert_eq!(hc.HCTSIZ.read(), 0x7FFFF | (1 << 19));
    }

    #[test]
    fn channel_enable_bits() {
        let hc = channel();
        write_reg!(otg, &hc, HCCHAR, CHDIS: 1);
        assert!(read_reg!(otg, &hc, HCCHAR, CHDIS == 1));
        ral_registers::modify_reg!(otg, &hc, HCCHAR, CHDIS: 0, CHENA: 1);
        assert_eq!(hc.HCCHAR.read(), 1 << 31);
    }

    #[test]
    fn hprt_write_one_to_clear_mask() {
        assert_eq!(otg::HPRT_W1C, (1 << 2) | (1 << 3) | (1 << 5));
    }
}
