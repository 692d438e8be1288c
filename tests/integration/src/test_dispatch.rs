// Licensed under the Apache-2.0 license

#[cfg(test)]
mod test {
    use crate::test::{leak, Bench, Recorder};
    use emulator_periph::Faults;
    use espi_driver::hil::{Channel, Wire};
    use espi_driver::regs::ErrMask;
    use espi_driver::flash::maf::MafRequest;
    use espi_driver::hil::{EspiEvent, OobChannel};
    use espi_driver::pcbm::PcBmRequest;
    use espi_driver::regs::{EspiSts, RegisterAccess, ESPIERR, ESPIIE};
    use espi_driver::request::Issued;
    use espi_driver::{EspiConfig, EspiError};
    use std::cell::Cell;

    #[derive(Default)]
    struct Oob {
        packets: Cell<usize>,
    }

    impl OobChannel for Oob {
        fn handle_rx(&self) {
            self.packets.set(self.packets.get() + 1);
        }
    }

    #[test]
    fn test_init_programs_enables() {
        let bench = Bench::default();
        let config = EspiConfig::default();
        let irq_enable = config.irq_enable;
        let mut espi = bench.espi(config);
        espi.init().unwrap();
        assert_eq!(bench.emu.get_raw(ESPIIE), irq_enable);
        assert!(!bench.emu.irq_pending());
    }

    #[test]
    fn test_platform_reset_reaches_virtual_wires() {
        let bench = Bench::default();
        let rec = Recorder::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.set_client(&rec);
        espi.init().unwrap();

        bench.emu.raise(EspiSts::PltRst::SET);
        assert!(bench.emu.irq_pending());
        espi.handle_interrupt();
        assert_eq!(bench.vw.platform_resets(), 1);
        assert_eq!(*rec.events.borrow(), vec![EspiEvent::PlatformReset]);
        assert_eq!(bench.emu.status(), 0);
    }

    #[test]
    fn test_bus_error_is_reported_and_cleared() {
        let bench = Bench::default();
        let rec = Recorder::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.set_client(&rec);
        espi.init().unwrap();

        bench.emu.raise_bus_error(0x4);
        espi.handle_interrupt();
        assert_eq!(*rec.events.borrow(), vec![EspiEvent::BusError(0x4)]);
        assert_eq!(bench.emu.get_raw(ESPIERR), 0);
        assert!(!bench.emu.irq_pending());
    }

    #[test]
    fn test_updates_and_side_channels() {
        let bench = Bench::default();
        let rec = Recorder::default();
        let oob = Oob::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.set_client(&rec);
        espi.set_oob(&oob);
        espi.init().unwrap();

        bench
            .emu
            .raise(EspiSts::VwUpd::SET + EspiSts::OobRx::SET + EspiSts::CfgUpd::SET);
        espi.handle_interrupt();
        assert_eq!(bench.vw.updates(), 1);
        assert_eq!(oob.packets.get(), 1);
        assert_eq!(*rec.events.borrow(), vec![EspiEvent::ConfigUpdate]);

        // Not enabled by default: left pending and unreported.
        bench.emu.raise(EspiSts::PMsgRx::SET);
        espi.handle_interrupt();
        assert_eq!(bench.emu.status(), EspiSts::PMsgRx::SET.value);
        assert_eq!(rec.events.borrow().len(), 1);
    }

    #[test]
    fn test_reset_aborts_both_channels() {
        let bench = Bench::default();
        let rec = Recorder::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.pcbm().set_client(&rec);
        espi.maf().set_client(&rec);
        espi.set_client(&rec);
        espi.init().unwrap();

        bench.emu.inject(Faults {
            bm_stall: true,
            flash_stall: true,
            ..Faults::default()
        });
        assert!(matches!(
            espi.pcbm().send_req(PcBmRequest::read(0, 32), leak(32)),
            Ok(Issued::Pending)
        ));
        assert!(matches!(
            espi.maf().send_req(MafRequest::read(0, 32), leak(32)),
            Ok(Issued::Pending)
        ));

        bench.emu.raise(EspiSts::IbRst::SET);
        espi.handle_interrupt();

        let results: Vec<Result<usize, EspiError>> =
            rec.take_done().into_iter().map(|(_, r)| r).collect();
        assert_eq!(results, vec![Err(EspiError::Aborted); 2]);
        assert_eq!(*rec.events.borrow(), vec![EspiEvent::InBandReset]);

        // Both channels take new work after the reset.
        bench.emu.inject(Faults::default());
        assert!(matches!(
            espi.pcbm().send_req(PcBmRequest::read(0, 8).polling(), leak(8)),
            Ok(Issued::Complete(_))
        ));
        assert!(matches!(
            espi.maf().send_req(MafRequest::read(0, 8).polling(), leak(8)),
            Ok(Issued::Complete(_))
        ));
    }

    #[test]
    fn test_boot_load_done_drives_wires() {
        let bench = Bench::default();
        let espi = bench.espi(EspiConfig::default());

        bench.vw.set_ready(Channel::VirtualWire, false);
        assert_eq!(espi.boot_load_done(true), Err(EspiError::ChannelDisabled));
        assert!(bench.vw.wires().is_empty());

        bench.vw.set_ready(Channel::VirtualWire, true);
        espi.boot_load_done(true).unwrap();
        assert_eq!(
            bench.vw.wires(),
            vec![(Wire::BootLoadStatus, true), (Wire::BootLoadDone, true)]
        );
    }

    #[test]
    fn test_reset_drops_error_wire() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        bench.emu.inject(Faults {
            flash_auto_error: Some(ErrMask::TagErr::SET.value),
            ..Faults::default()
        });
        let req = MafRequest::read(0, 128).auto().polling();
        assert!(espi.maf().send_req(req, leak(128)).is_err());
        assert_eq!(bench.vw.level(Wire::NonFatalError), Some(true));

        bench.emu.raise(EspiSts::EspiRst::SET);
        espi.handle_interrupt();
        assert_eq!(bench.vw.level(Wire::NonFatalError), Some(false));
        assert!(!espi.maf().error_wire_asserted());
    }
}
