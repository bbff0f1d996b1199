//! Renders every CRD in this crate as a multi-document YAML stream,
//! suitable for `kubectl apply -f -`.

use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        serde_yaml::to_string(&crds::VirtualMachine::crd())?,
        serde_yaml::to_string(&crds::VirtualMachineOperation::crd())?,
        serde_yaml::to_string(&crds::VirtualMachineBlockDeviceAttachment::crd())?,
        serde_yaml::to_string(&crds::VirtualMachineIpAddress::crd())?,
        serde_yaml::to_string(&crds::VirtualMachineClass::crd())?,
        serde_yaml::to_string(&crds::VirtualDisk::crd())?,
        serde_yaml::to_string(&crds::VirtualImage::crd())?,
        serde_yaml::to_string(&crds::ClusterVirtualImage::crd())?,
        serde_yaml::to_string(&crds::UsbDevice::crd())?,
        serde_yaml::to_string(&crds::HypervisorVirtualMachine::crd())?,
        serde_yaml::to_string(&crds::HypervisorVirtualMachineInstance::crd())?,
        serde_yaml::to_string(&crds::HypervisorVmMigration::crd())?,
    ];
    print!("{}", crds.join("---\n"));
    Ok(())
}
