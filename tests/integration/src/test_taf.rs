// Licensed under the Apache-2.0 license

#[cfg(test)]
mod test {
    use crate::test::{pattern, taf_config, Bench, Recorder};
    use emulator_periph::{Completion, Faults, SpiNorFlash};
    use espi_driver::config::FlashConfig;
    use espi_driver::flash::protection::ProtectionRegion;
    use espi_driver::hil::{FlashDevice, Wire};
    use espi_driver::packet::{Address, FlashCycleType, Header};
    use espi_driver::regs::{EspiSts, FlashAccCtl, FlashCtl, RegisterAccess, FLASHACCCTL, FLASHCTL};
    use espi_driver::{EspiConfig, EspiError, Status, TafStatus};

    fn part(name: &str) -> SpiNorFlash {
        SpiNorFlash::new(name).unwrap()
    }

    fn settle(flash: &SpiNorFlash) {
        while flash.is_busy() {}
    }

    fn program(flash: &SpiNorFlash, offset: u32, data: &[u8]) {
        flash.write_page(offset, data).unwrap();
        settle(flash);
    }

    fn codes(completions: &[Completion]) -> Vec<u8> {
        completions.iter().map(|c| c.code).collect()
    }

    #[test]
    fn test_read_is_split_into_segments() {
        let bench = Bench::default();
        let flash = part("w25q16jv");
        let rec = Recorder::default();
        let data = pattern(256, 0x21);
        program(&flash, 0x100, &data);

        let mut espi = bench.espi(taf_config());
        espi.taf().set_device(&flash);
        espi.taf().set_client(&rec);
        espi.init().unwrap();
        assert!(bench.emu.is_set(FLASHCTL, FlashCtl::NpFree));

        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Read, 3, 0x100, 256, &[]));
        espi.handle_interrupt();

        let cpl = bench.emu.taf_completions();
        assert_eq!(codes(&cpl), vec![0x0b, 0x0d, 0x0d, 0x0f]);
        assert!(cpl.iter().all(|c| c.tag == 3));
        let read: Vec<u8> = cpl.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(read, data);

        let handled = rec.taf.borrow();
        assert_eq!(handled.len(), 1);
        assert_eq!(handled[0].0.offset, 0x100);
        assert_eq!(handled[0].0.size, 256);
        assert_eq!(handled[0].1, TafStatus::Ok);
        assert!(bench.emu.is_set(FLASHCTL, FlashCtl::NpFree));
        assert!(!espi.taf().is_pending_res());
    }

    #[test]
    fn test_write_spans_device_pages() {
        let bench = Bench::default();
        let flash = part("w25q16jv");
        let mut espi = bench.espi(taf_config());
        espi.taf().set_device(&flash);
        espi.init().unwrap();

        let payload = pattern(64, 0x9c);
        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Write, 1, 0x20f0, 64, &payload));
        espi.handle_interrupt();
        settle(&flash);

        assert_eq!(
            bench.emu.taf_completions(),
            vec![Completion {
                code: 0x06,
                tag: 1,
                data: Vec::new()
            }]
        );
        assert_eq!(flash.contents(0x20f0, 64), payload);
    }

    #[test]
    fn test_erase_size_must_be_supported_by_device() {
        let bench = Bench::default();
        let flash = part("at25sl32b");
        let rec = Recorder::default();
        program(&flash, 0x3000, &[0x12; 16]);

        let mut espi = bench.espi(taf_config());
        espi.taf().set_device(&flash);
        espi.taf().set_client(&rec);
        espi.init().unwrap();

        // The controller offers 4 KiB erases; this part does not.
        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Erase, 2, 0x3000, 1, &[]));
        espi.handle_interrupt();
        assert_eq!(codes(&bench.emu.taf_completions()), vec![0x08]);
        assert_eq!(rec.taf.borrow()[0].1, TafStatus::InvalidDataSize);
        assert_eq!(flash.contents(0x3000, 16), vec![0x12; 16]);

        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Erase, 3, 0x3000, 2, &[]));
        espi.handle_interrupt();
        settle(&flash);
        assert_eq!(codes(&bench.emu.taf_completions()), vec![0x08, 0x06]);
        let erased = rec.taf.borrow()[1].0;
        assert_eq!((erased.offset, erased.size), (0, 0x8000));
        assert_eq!(flash.contents(0x3000, 16), vec![0xff; 16]);
    }

    #[test]
    fn test_locked_region_with_tag_override() {
        let bench = Bench::default();
        let flash = part("w25q16jv");
        let rec = Recorder::default();
        let mut espi = bench.espi(taf_config());
        espi.taf().set_device(&flash);
        espi.taf().set_client(&rec);
        espi.init().unwrap();

        let region = ProtectionRegion::new(0x1_0000, 0x1_f000)
            .write_protected()
            .allow_tag(5);
        espi.taf().set_rw_protect(0, &region).unwrap();
        espi.taf().lock_region(0).unwrap();

        let payload = [0x5a; 16];
        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Write, 1, 0x1_0000, 16, &payload));
        espi.handle_interrupt();
        assert_eq!(rec.taf.borrow()[0].1, TafStatus::AccessDenied);
        assert_eq!(bench.vw.asserted(Wire::NonFatalError), 1);
        assert_eq!(flash.contents(0x1_0000, 16), vec![0xff; 16]);

        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Write, 5, 0x1_0000, 16, &payload));
        espi.handle_interrupt();
        settle(&flash);
        assert_eq!(flash.contents(0x1_0000, 16), payload.to_vec());

        // Reads are not guarded by this region.
        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Read, 1, 0x1_0000, 16, &[]));
        espi.handle_interrupt();

        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Erase, 1, 0x1_2000, 1, &[]));
        espi.handle_interrupt();

        let cpl = bench.emu.taf_completions();
        assert_eq!(codes(&cpl), vec![0x08, 0x06, 0x09, 0x08]);
        assert_eq!(cpl[2].data, payload.to_vec());
        assert_eq!(bench.vw.asserted(Wire::NonFatalError), 2);

        assert_eq!(
            espi.taf().set_rw_protect(0, &ProtectionRegion::new(0, 0)),
            Err(EspiError::RegionLocked)
        );
        assert_eq!(espi.taf().clear_rw_protect(0), Err(EspiError::RegionLocked));
    }

    #[test]
    fn test_requests_past_the_device_are_denied() {
        let bench = Bench::default();
        let flash = part("w25q16jv");
        let rec = Recorder::default();
        let mut espi = bench.espi(taf_config());
        espi.taf().set_device(&flash);
        espi.taf().set_client(&rec);
        espi.init().unwrap();

        let end = flash.capacity() as u32;
        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Read, 0, end - 16, 64, &[]));
        espi.handle_interrupt();
        assert_eq!(codes(&bench.emu.taf_completions()), vec![0x08]);
        assert_eq!(rec.taf.borrow()[0].1, TafStatus::AccessDenied);
        assert_eq!(bench.vw.asserted(Wire::NonFatalError), 1);
    }

    #[test]
    fn test_base_address_offsets_host_requests() {
        let bench = Bench::default();
        let flash = part("w25q16jv");
        let rec = Recorder::default();
        let data = pattern(16, 0x60);
        program(&flash, 0x10_0010, &data);

        let mut config = taf_config();
        config.flash = FlashConfig {
            base_address: 0x10_0000,
            ..config.flash
        };
        let mut espi = bench.espi(config);
        espi.taf().set_device(&flash);
        espi.taf().set_client(&rec);
        espi.init().unwrap();

        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Read, 7, 0x10, 16, &[]));
        espi.handle_interrupt();
        assert_eq!(rec.taf.borrow()[0].0.offset, 0x10_0010);
        assert_eq!(bench.emu.taf_completions()[0].data, data);
    }

    #[test]
    fn test_offsets_at_the_top_of_the_address_space_are_denied() {
        let bench = Bench::default();
        let flash = part("w25q16jv");
        let rec = Recorder::default();
        let mut config = taf_config();
        config.flash = FlashConfig {
            base_address: 0x10_0000,
            ..config.flash
        };
        let mut espi = bench.espi(config);
        espi.taf().set_device(&flash);
        espi.taf().set_client(&rec);
        espi.init().unwrap();

        // The base address pushes the offset past 4 GiB.
        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Read, 2, 0xffff_ffc0, 64, &[]));
        espi.handle_interrupt();
        assert_eq!(rec.taf.borrow()[0].1, TafStatus::AccessDenied);

        // Rebases cleanly but the end of the range wraps.
        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Write, 3, 0xffef_ffc0, 64, &[0x11; 64]));
        espi.handle_interrupt();
        assert_eq!(rec.taf.borrow()[1].0.offset, 0xffff_ffc0);
        assert_eq!(rec.taf.borrow()[1].1, TafStatus::AccessDenied);

        assert_eq!(codes(&bench.emu.taf_completions()), vec![0x08, 0x08]);
        assert_eq!(bench.vw.asserted(Wire::NonFatalError), 2);
        assert!(espi.taf().error_wire_asserted());
        assert_eq!(flash.contents(0, 64), vec![0xff; 64]);
    }

    #[test]
    fn test_malformed_requests_are_refused() {
        let bench = Bench::default();
        let flash = part("w25q16jv");
        let rec = Recorder::default();
        let mut espi = bench.espi(taf_config());
        espi.taf().set_device(&flash);
        espi.taf().set_client(&rec);
        espi.init().unwrap();

        let unknown = Header {
            cycle_type: 0x07,
            tag: 4,
            length: 0,
            address: Address::Addr32(0),
        };
        assert!(bench.emu.host_flash_request(&unknown, &[]));
        espi.handle_interrupt();
        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Read, 4, 0, 0, &[]));
        espi.handle_interrupt();
        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Read, 4, 0, 512, &[]));
        espi.handle_interrupt();
        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Write, 4, 0, 65, &[0; 65]));
        espi.handle_interrupt();

        let statuses: Vec<TafStatus> = rec.taf.borrow().iter().map(|(_, s)| *s).collect();
        assert_eq!(
            statuses,
            vec![
                TafStatus::InvalidType,
                TafStatus::InvalidDataSize,
                TafStatus::InvalidDataSize,
                TafStatus::InvalidDataSize
            ]
        );
        let cpl = bench.emu.taf_completions();
        assert_eq!(codes(&cpl), vec![0x08; 4]);
        assert!(cpl.iter().all(|c| c.tag == 4));
        assert_eq!(espi.taf().get_status(), Status::Failed);
    }

    #[test]
    fn test_rpmc_is_acknowledged() {
        let bench = Bench::default();
        let flash = part("w25q16jv");
        let rec = Recorder::default();
        let mut espi = bench.espi(taf_config());
        espi.taf().set_device(&flash);
        espi.taf().set_client(&rec);
        espi.init().unwrap();

        let op = [1, 2, 3, 4, 5, 6, 7, 8];
        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::RpmcOp1, 6, 0, op.len(), &op));
        espi.handle_interrupt();
        assert_eq!(codes(&bench.emu.taf_completions()), vec![0x06]);
        assert_eq!(rec.taf.borrow()[0].0.payload(), &op);
    }

    #[test]
    fn test_caller_driven_responses() {
        let bench = Bench::default();
        let flash = part("w25q16jv");
        let mut config = taf_config();
        config.flash.auto_respond = false;
        let mut espi = bench.espi(config);
        espi.taf().set_device(&flash);
        espi.init().unwrap();

        assert_eq!(espi.taf().send_res(), Ok(false));
        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Read, 2, 0, 128, &[]));
        assert_eq!(espi.taf().handle_req(), Ok(TafStatus::Ok));
        assert!(espi.taf().is_pending_res());
        assert_eq!(espi.taf().get_status(), Status::Busy);
        // The host cannot queue another request meanwhile.
        assert!(!bench.emu.host_flash_cycle(FlashCycleType::Read, 3, 0, 4, &[]));

        assert_eq!(espi.taf().send_res(), Ok(true));
        assert_eq!(codes(&bench.emu.taf_completions()), vec![0x0b]);
        assert!(!bench.emu.is_set(FLASHCTL, FlashCtl::NpFree));
        assert_eq!(espi.taf().send_res(), Ok(true));
        assert_eq!(espi.taf().send_res(), Ok(false));
        assert_eq!(codes(&bench.emu.taf_completions()), vec![0x0b, 0x0f]);
        assert!(bench.emu.is_set(FLASHCTL, FlashCtl::NpFree));
        assert_eq!(espi.taf().get_status(), Status::Ok);
    }

    #[test]
    fn test_host_access_gating() {
        let bench = Bench::default();
        let flash = part("w25q16jv");
        let mut config = taf_config();
        config.flash.auto_respond = false;
        let mut espi = bench.espi(config);
        espi.taf().set_device(&flash);
        espi.init().unwrap();

        // A request still sitting in the receive buffer.
        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Write, 1, 0, 4, &[1, 2, 3, 4]));
        assert_eq!(espi.taf().prevent_host_access(), Err(EspiError::Busy));
        espi.handle_interrupt();
        // Handled but not answered.
        assert_eq!(espi.taf().prevent_host_access(), Err(EspiError::Busy));
        espi.taf().respond_all().unwrap();

        espi.taf().prevent_host_access().unwrap();
        assert!(bench.emu.is_set(FLASHACCCTL, FlashAccCtl::BlockNpFree));
        assert!(!bench.emu.host_flash_cycle(FlashCycleType::Read, 2, 0, 4, &[]));

        espi.taf().reenable_host_access();
        assert!(!bench.emu.is_set(FLASHACCCTL, FlashAccCtl::AutoRdDisCtl));
        assert!(bench.emu.host_flash_cycle(FlashCycleType::Read, 2, 0, 4, &[]));
    }

    #[test]
    fn test_host_access_gating_gives_up() {
        let bench = Bench::default();
        let flash = part("w25q16jv");
        let mut config = taf_config();
        config.busy_wait_timeout = 64;
        let mut espi = bench.espi(config);
        espi.taf().set_device(&flash);
        espi.init().unwrap();

        bench.emu.inject(Faults {
            auto_rd_dis_stuck: true,
            ..Faults::default()
        });
        assert_eq!(espi.taf().prevent_host_access(), Err(EspiError::Busy));
        assert!(!bench.emu.is_set(FLASHACCCTL, FlashAccCtl::AutoRdDisCtl));
        assert!(!bench.emu.is_set(FLASHACCCTL, FlashAccCtl::BlockNpFree));
        assert!(bench.emu.host_flash_cycle(FlashCycleType::Read, 2, 0, 4, &[]));
    }

    #[test]
    fn test_reset_drops_pending_response() {
        let bench = Bench::default();
        let flash = part("w25q16jv");
        let mut config = taf_config();
        config.flash.auto_respond = false;
        let mut espi = bench.espi(config);
        espi.taf().set_device(&flash);
        espi.init().unwrap();

        assert!(bench
            .emu
            .host_flash_cycle(FlashCycleType::Read, 9, 0, 256, &[]));
        espi.handle_interrupt();
        assert_eq!(espi.taf().send_res(), Ok(true));

        bench.emu.raise(EspiSts::EspiRst::SET);
        espi.handle_interrupt();
        assert!(!espi.taf().is_pending_res());
        assert_eq!(espi.taf().get_status(), Status::Failed);
        assert_eq!(espi.taf().send_res(), Ok(false));
        assert_eq!(codes(&bench.emu.taf_completions()), vec![0x0b]);
        assert!(bench.emu.host_flash_cycle(FlashCycleType::Read, 1, 0, 4, &[]));
    }

    #[test]
    fn test_config_rejects_master_attached_mode() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        assert_eq!(
            espi.taf().config(&FlashConfig::default()),
            Err(EspiError::InvalidType)
        );
    }
}
