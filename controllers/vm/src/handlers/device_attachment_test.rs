use super::*;

fn usb(name: &str, bus: u32, device: u32) -> HvmHostUsbDevice {
    HvmHostUsbDevice {
        name: name.to_owned(),
        bus,
        device,
    }
}

fn pvc_volume(name: &str, claim: &str, hotpluggable: bool) -> HvmVolume {
    HvmVolume {
        name: name.to_owned(),
        persistent_volume_claim: Some(HvmPvcVolumeSource {
            claim_name: claim.to_owned(),
            hotpluggable,
        }),
        ..Default::default()
    }
}

#[test]
fn usb_kept_when_sets_match() {
    let set = vec![usb("dongle", 1, 4)];
    assert_eq!(plan_usb(&set, &set, false), UsbAction::Keep);
}

#[test]
fn usb_replaced_on_difference() {
    let desired = vec![usb("dongle", 1, 4), usb("token", 2, 7)];
    let current = vec![usb("dongle", 1, 4)];
    assert_eq!(
        plan_usb(&desired, &current, false),
        UsbAction::Replace(desired.clone())
    );
}

#[test]
fn migration_detaches_attached_usb() {
    let desired = vec![usb("dongle", 1, 4)];
    let current = vec![usb("dongle", 1, 4)];
    assert_eq!(plan_usb(&desired, &current, true), UsbAction::DetachAll);
}

#[test]
fn migration_with_nothing_attached_keeps_quiet() {
    let desired = vec![usb("dongle", 1, 4)];
    assert_eq!(plan_usb(&desired, &[], true), UsbAction::Keep);
}

#[test]
fn split_keeps_declared_and_cloud_init_in_base() {
    let volumes = vec![
        pvc_volume("vd-root", "root-pvc", false),
        HvmVolume {
            name: CLOUD_INIT_VOLUME.to_owned(),
            ..Default::default()
        },
        pvc_volume("vd-scratch", "scratch-pvc", true),
    ];
    let declared = vec!["vd-root".to_owned()];
    let (base, hotplug) = split_hotplug_volumes(&volumes, &declared);
    let names = |vs: &[HvmVolume]| vs.iter().map(|v| v.name.clone()).collect::<Vec<_>>();
    assert_eq!(names(&base), vec!["vd-root", CLOUD_INIT_VOLUME]);
    assert_eq!(names(&hotplug), vec!["vd-scratch"]);
}
